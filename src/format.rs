//! Wire-format constants: magics, algorithm IDs, dictionary keys, limits.
//!
//! # Item framing
//! Every item in a volume starts with an 8-byte ASCII magic.  The magic set
//! is a closed list: readers reject anything not in [`VALID_MAGICS`] as
//! corruption, they never skip unknown items.
//!
//! # Identity rules
//! Compression and cipher algorithms are identified by frozen u16 wire IDs.
//! An ID is never reused, even if an algorithm is dropped from a build
//! (LZO's ID stays reserved).  Compression IDs are additionally ordered by
//! strength: the out-of-memory fallback rule ("retry at the default when the
//! requested algorithm is stronger") compares raw IDs.
//!
//! # Endianness
//! All numeric fields on disk are little-endian.  Magics are raw ASCII.

use thiserror::Error;

/// Byte length of every on-disk magic tag.
pub const MAGIC_LEN: usize = 8;

/// An 8-byte ASCII item tag.
pub type Magic = [u8; MAGIC_LEN];

// ── Magic tags ───────────────────────────────────────────────────────────────

/// Archive main header — first queued item of every archive.
pub const MAGIC_MAIN: &Magic = b"FsApMain";
/// Volume head — first item of every volume file (never queued).
pub const MAGIC_VOLHEAD: &Magic = b"FsApVolH";
/// Volume foot — last item of every volume file (never queued).
pub const MAGIC_VOLFOOT: &Magic = b"FsApVolF";
/// Filesystem begin.
pub const MAGIC_FSBEGIN: &Magic = b"FsApFsBe";
/// Filesystem end.
pub const MAGIC_FSEND: &Magic = b"FsApFsEn";
/// Object entry (directory, file, symlink, special node).
pub const MAGIC_OBJECT: &Magic = b"FsApObjt";
/// File data end — carries the content hash of the preceding blocks.
pub const MAGIC_FILEEND: &Magic = b"FsApFilE";
/// Data block header.
pub const MAGIC_BLOCK: &Magic = b"FsApBlkH";
/// Archive footer — terminal item.
pub const MAGIC_DATAEND: &Magic = b"FsApDEnd";

/// The closed list of magics a reader accepts.
pub const VALID_MAGICS: &[&Magic] = &[
    MAGIC_MAIN,
    MAGIC_VOLHEAD,
    MAGIC_VOLFOOT,
    MAGIC_FSBEGIN,
    MAGIC_FSEND,
    MAGIC_OBJECT,
    MAGIC_FILEEND,
    MAGIC_BLOCK,
    MAGIC_DATAEND,
];

/// True if `magic` belongs to the closed on-disk set.
pub fn is_magic_valid(magic: &Magic) -> bool {
    VALID_MAGICS.iter().any(|m| *m == magic)
}

/// `fsid` value for headers that are not scoped to one filesystem
/// (main header, volume records, archive footer).
pub const FSID_NONE: u16 = 0xFFFF;

// ── Format version / limits ──────────────────────────────────────────────────

/// Current archive format version.
pub const FORMAT_VERSION: u32 = 1;

/// Smallest accepted block payload size.
pub const MIN_BLOCK_SIZE: u64 = 4096;
/// Largest accepted block payload size (64 MiB).
pub const MAX_BLOCK_SIZE: u64 = 64 * 1024 * 1024;
/// Default chunking size for regular-file payloads (256 KiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 256 * 1024;

/// Default soft bound on in-flight blocks in the pipeline queue.
pub const DEFAULT_QUEUE_BLOCKS: usize = 32;

/// Upper bound on `blkarsize` relative to `blkrealsize`, validated before a
/// reader allocates a payload buffer.  Mirrors the transformer's scratch
/// sizing plus the cipher headroom.
pub fn max_archived_size(realsize: u64) -> u64 {
    realsize + realsize / 16 + 64 + 3 + 8
}

// ── Compression algorithms ───────────────────────────────────────────────────

/// Compression algorithm wire ID.  The discriminants are the on-disk values
/// and double as a strength ranking (see module docs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum CompressAlgo {
    #[default]
    None  = 0,
    Lz4   = 1,
    /// Reserved: the original archiver compiles LZO support conditionally;
    /// this build does not carry an LZO primitive.
    Lzo   = 2,
    Gzip  = 3,
    Zstd  = 4,
    Bzip2 = 5,
    Lzma  = 6,
}

/// Fallback target when a stronger codec runs out of memory.
pub const DEFAULT_COMPRESS_ALGO: CompressAlgo = CompressAlgo::Gzip;
/// Level used together with [`DEFAULT_COMPRESS_ALGO`] on fallback.
pub const DEFAULT_COMPRESS_LEVEL: u8 = 6;

impl CompressAlgo {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(CompressAlgo::None),
            1 => Some(CompressAlgo::Lz4),
            2 => Some(CompressAlgo::Lzo),
            3 => Some(CompressAlgo::Gzip),
            4 => Some(CompressAlgo::Zstd),
            5 => Some(CompressAlgo::Bzip2),
            6 => Some(CompressAlgo::Lzma),
            _ => None,
        }
    }

    /// Human-readable name (diagnostics and CLI, never parsed from disk).
    pub fn name(self) -> &'static str {
        match self {
            CompressAlgo::None  => "none",
            CompressAlgo::Lz4   => "lz4",
            CompressAlgo::Lzo   => "lzo",
            CompressAlgo::Gzip  => "gzip",
            CompressAlgo::Zstd  => "zstd",
            CompressAlgo::Bzip2 => "bzip2",
            CompressAlgo::Lzma  => "lzma",
        }
    }

    /// Parse a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"  => Some(CompressAlgo::None),
            "lz4"   => Some(CompressAlgo::Lz4),
            "lzo"   => Some(CompressAlgo::Lzo),
            "gzip"  => Some(CompressAlgo::Gzip),
            "zstd"  => Some(CompressAlgo::Zstd),
            "bzip2" => Some(CompressAlgo::Bzip2),
            "lzma"  => Some(CompressAlgo::Lzma),
            _       => None,
        }
    }
}

// ── Cipher algorithms ────────────────────────────────────────────────────────

/// Cipher wire ID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum CryptAlgo {
    #[default]
    None     = 0,
    Blowfish = 1,
}

impl CryptAlgo {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(CryptAlgo::None),
            1 => Some(CryptAlgo::Blowfish),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CryptAlgo::None     => "none",
            CryptAlgo::Blowfish => "blowfish",
        }
    }
}

// ── Object types ─────────────────────────────────────────────────────────────

/// Filesystem object kind carried in object entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ObjType {
    Dir      = 1,
    RegFile  = 2,
    Symlink  = 3,
    Hardlink = 4,
    CharDev  = 5,
    BlockDev = 6,
    Fifo     = 7,
    Socket   = 8,
}

impl ObjType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(ObjType::Dir),
            2 => Some(ObjType::RegFile),
            3 => Some(ObjType::Symlink),
            4 => Some(ObjType::Hardlink),
            5 => Some(ObjType::CharDev),
            6 => Some(ObjType::BlockDev),
            7 => Some(ObjType::Fifo),
            8 => Some(ObjType::Socket),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjType::Dir      => "dir",
            ObjType::RegFile  => "regfile",
            ObjType::Symlink  => "symlink",
            ObjType::Hardlink => "hardlink",
            ObjType::CharDev  => "chardev",
            ObjType::BlockDev => "blockdev",
            ObjType::Fifo     => "fifo",
            ObjType::Socket   => "socket",
        }
    }
}

// ── Dictionary keys ──────────────────────────────────────────────────────────
//
// Keys are scoped per magic; the same numeric key means different things under
// different magics.  Values are frozen once released.

/// `FsApMain` keys.
pub mod mainhead {
    pub const KEY_VERSION: u16 = 1;      // u32 format version
    pub const KEY_ARCHIVE_ID: u16 = 2;   // u32 non-zero archive id
    pub const KEY_CREATE_TIME: u16 = 3;  // u64 unix seconds
    pub const KEY_LABEL: u16 = 4;        // bytes, optional
    pub const KEY_FSCOUNT: u16 = 5;      // u16 filesystem count
    pub const KEY_COMPRESS_ALGO: u16 = 6; // u16 requested algo
    pub const KEY_CRYPT_ALGO: u16 = 7;   // u16 cipher algo
    pub const KEY_BLOCK_SIZE: u16 = 8;   // u64 chunking size
}

/// `FsApVolH` / `FsApVolF` keys.
pub mod volume {
    pub const KEY_ARCHIVE_ID: u16 = 1;   // u32
    pub const KEY_VOLNUM: u16 = 2;       // u32
    pub const KEY_LASTVOL: u16 = 3;      // u8, foot only: 1 = final volume
}

/// `FsApFsBe` keys.
pub mod fsbegin {
    pub const KEY_ROOT_PATH: u16 = 1;    // bytes, original root path
}

/// `FsApFsEn` keys.
pub mod fsend {
    pub const KEY_OBJ_COUNT: u16 = 1;    // u64 objects emitted
    pub const KEY_BYTES_TOTAL: u16 = 2;  // u64 regular-file bytes
}

/// `FsApObjt` keys.
pub mod object {
    pub const KEY_TYPE: u16 = 1;         // u16 ObjType
    pub const KEY_PATH: u16 = 2;         // bytes, archive-relative path
    pub const KEY_SIZE: u16 = 3;         // u64, regular files only
    pub const KEY_MODE: u16 = 4;         // u32 unix permission bits
    pub const KEY_MTIME: u16 = 5;        // u64 unix seconds
    pub const KEY_LINK_TARGET: u16 = 6;  // bytes, symlink/hardlink target
    pub const KEY_RDEV: u16 = 7;         // u64, device nodes only
}

/// `FsApFilE` keys.
pub mod fileend {
    pub const KEY_CONTENT_HASH: u16 = 1; // bytes, 32-byte BLAKE3
    pub const KEY_SIZE: u16 = 2;         // u64, bytes hashed
}

/// `FsApDEnd` keys.
pub mod dataend {
    pub const KEY_ARCHIVE_ID: u16 = 1;   // u32, must match main header
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("invalid magic {0:?} — not part of the archive format")]
    BadMagic([u8; MAGIC_LEN]),
    #[error("unsupported format version {0} (this build reads v{FORMAT_VERSION})")]
    UnsupportedVersion(u32),
    #[error("unknown compression algorithm id {0}")]
    BadCompressAlgo(u16),
    #[error("unknown cipher algorithm id {0}")]
    BadCryptAlgo(u16),
    #[error("block sizes out of bounds: realsize={realsize} arsize={arsize}")]
    BadBlockSizes { realsize: u64, arsize: u64 },
    #[error("volume continuity broken: {0}")]
    VolumeMismatch(String),
    #[error("corrupt stream: {0}")]
    Corrupt(String),
    #[error("missing dictionary key {key} in {magic} header")]
    MissingKey { magic: String, key: u16 },
    #[error(transparent)]
    Dico(#[from] crate::dico::DicoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magics_are_eight_ascii_bytes() {
        for m in VALID_MAGICS {
            assert_eq!(m.len(), MAGIC_LEN);
            assert!(m.iter().all(|b| b.is_ascii_graphic()));
        }
        assert!(is_magic_valid(MAGIC_BLOCK));
        assert!(!is_magic_valid(b"FsApNope"));
    }

    #[test]
    fn compress_ids_round_trip_and_rank() {
        for id in 0..=6u16 {
            let algo = CompressAlgo::from_u16(id).unwrap();
            assert_eq!(algo as u16, id);
            assert_eq!(CompressAlgo::from_name(algo.name()), Some(algo));
        }
        assert!(CompressAlgo::from_u16(7).is_none());
        // Strength ordering drives the OOM fallback rule.
        assert!(CompressAlgo::Lzma > DEFAULT_COMPRESS_ALGO);
        assert!(CompressAlgo::Bzip2 > DEFAULT_COMPRESS_ALGO);
        assert!(CompressAlgo::Zstd > DEFAULT_COMPRESS_ALGO);
        assert!(CompressAlgo::Lz4 < DEFAULT_COMPRESS_ALGO);
    }

    #[test]
    fn objtype_round_trip() {
        for id in 1..=8u16 {
            assert_eq!(ObjType::from_u16(id).unwrap() as u16, id);
        }
        assert!(ObjType::from_u16(0).is_none());
        assert!(ObjType::from_u16(9).is_none());
    }
}
