//! # fsapack — multi-threaded filesystem archiver (.fsa format)
//!
//! One producer, N compress/encrypt workers and one consumer cooperate
//! through a single bounded FIFO queue to build (or restore) a
//! self-describing archive.
//!
//! Format guarantees (frozen in v1):
//! - All numeric fields are little-endian; never negotiated
//! - Every item starts with an 8-byte ASCII magic from a closed list;
//!   unknown magics abort the read
//! - Every data block carries a Fletcher-32 checksum of its final on-disk
//!   bytes; restore zero-fills blocks that fail it rather than aborting
//! - Header metadata lives in typed key/value dictionaries written in
//!   ascending key order; decoders accept any order
//! - Compression and cipher identities are frozen u16 wire IDs; an ID this
//!   build cannot supply fails the block, it is never re-mapped
//! - Encryption is Blowfish-CFB with the literal IV `"fsarchiv"` —
//!   length-preserving, constant per format version
//! - Volumes after the first replace the last two characters of the base
//!   path with a zero-padded volume number (`name.fsa` → `name.f01`)
//!
//! Pipeline guarantees:
//! - The consumer sees items in exact enqueue order, whatever order the
//!   worker pool finishes them in
//! - Backpressure throttles blocks only; header records always flow
//! - Every blocking queue operation re-checks cancellation at least once
//!   per second

pub mod checksum;
pub mod format;
pub mod dico;
pub mod queue;
pub mod codec;
pub mod crypto;
pub mod transform;
pub mod io_stream;
pub mod options;
pub mod stats;
pub mod util;
pub mod pack;
pub mod unpack;
pub mod pipeline;

// Flat re-exports for the most common types.
pub use checksum::fletcher32;
pub use codec::{get_codec, BuiltinCodecs, Codec, CodecError, CodecProvider};
pub use dico::{Dico, DicoValue};
pub use format::{CompressAlgo, CryptAlgo, FormatError, ObjType, FORMAT_VERSION};
pub use io_stream::{ArchiveItem, ArchiveReader, ArchiveWriter};
pub use options::ArchiveOptions;
pub use pipeline::{run_pack, run_unpack, PipelineContext, PipelineControl, PipelineError};
pub use queue::{BlockInfo, BlockQueue, HeadInfo, Item, ItemKind, QueueError, Status};
pub use stats::{Stats, StatsSnapshot};
pub use transform::{compress_block, decompress_block, BlockHealth, TransformDirection};
