//! Block transformation: compress+encrypt on archive creation,
//! decrypt+decompress on restore, and the worker loop driving both.
//!
//! # Write direction
//! The scratch buffer is sized `n + n/16 + 64 + 3` — a safe upper bound for
//! every supported codec, including expansion on incompressible input.  A
//! compressed form is adopted only when it is strictly smaller than the
//! original; otherwise the block is stored verbatim with `comp_algo = None`.
//! When a codec reports out-of-memory and the requested algorithm is
//! stronger than the default, the block is retried exactly once at the
//! default algorithm and level; out-of-memory beyond that is a block-level
//! error that stops the whole operation.  The checksum is computed last,
//! over the final on-archive bytes.
//!
//! # Read direction
//! The checksum is verified first, before cipher or codec run.  A mismatch
//! zero-fills the block (restored data is deterministic, not garbage),
//! records a corruption event and leaves the stream running.  Decoder
//! failures are handled the same way.  A missing key or a post-decipher
//! length mismatch is structural and fatal.
//!
//! # Worker loop
//! Each worker claims the earliest TODO block, transforms it and completes
//! it in place; a fatal error sets `stopfillqueue` and exits the worker,
//! which the supervisor treats as terminal for the whole run.

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::checksum::fletcher32;
use crate::codec::{CodecError, CodecProvider};
use crate::crypto::{self, CryptoError};
use crate::format::{
    CompressAlgo, CryptAlgo, DEFAULT_COMPRESS_ALGO, DEFAULT_COMPRESS_LEVEL,
};
use crate::options::ArchiveOptions;
use crate::pipeline::PipelineContext;
use crate::queue::{BlockInfo, QueueError};

/// Outcome of one block transformation on the restore path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHealth {
    Intact,
    /// The block was zero-filled after a checksum or decoder failure.
    Corrupt,
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Which way the worker pool transforms blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDirection {
    Compress,
    Decompress,
}

/// Scratch allocation for compressing `realsize` bytes.
fn scratch_size(realsize: usize) -> usize {
    realsize + realsize / 16 + 64 + 3
}

// ── Write direction ──────────────────────────────────────────────────────────

/// Compress and (optionally) encrypt a raw block in place, then stamp its
/// final checksum.
pub fn compress_block(
    block: &mut BlockInfo,
    opts: &ArchiveOptions,
    codecs: &dyn CodecProvider,
) -> Result<(), TransformError> {
    let realsize = block.real_size as usize;
    let mut scratch = vec![0u8; scratch_size(realsize)];

    // First attempt uses the requested algorithm; on ENOMEM from a stronger-
    // than-default codec we fall back to the default exactly once.
    let mut algo = opts.compress_algo;
    let mut level = opts.compress_level;
    let mut retried = false;

    let adopted: Option<(usize, CompressAlgo)> = loop {
        if algo == CompressAlgo::None {
            break None;
        }
        let codec = codecs.resolve(algo)?;
        match codec.encode(&block.data, &mut scratch, level) {
            Ok(n) if (n as u64) < block.real_size => break Some((n, algo)),
            Ok(_) => break None,
            Err(CodecError::Enomem) => {
                if !retried && algo > DEFAULT_COMPRESS_ALGO {
                    warn!(
                        from = algo.name(),
                        to = DEFAULT_COMPRESS_ALGO.name(),
                        "codec out of memory, retrying block at the default algorithm"
                    );
                    algo = DEFAULT_COMPRESS_ALGO;
                    level = DEFAULT_COMPRESS_LEVEL;
                    retried = true;
                    continue;
                }
                return Err(CodecError::Enomem.into());
            }
            Err(e @ CodecError::Unavailable(_)) => return Err(e.into()),
            Err(e) => {
                debug!(algo = algo.name(), error = %e, "compression failed, storing block verbatim");
                break None;
            }
        }
    };

    match adopted {
        Some((compsize, used)) => {
            scratch.truncate(compsize);
            block.data = scratch;
            block.comp_algo = used;
            block.comp_size = compsize as u64;
            block.archive_size = compsize as u64;
        }
        None => {
            // Compressed form is no smaller (or the codec failed):
            // keep the original bytes.
            block.comp_algo = CompressAlgo::None;
            block.comp_size = block.real_size;
            block.archive_size = block.real_size;
        }
    }

    if opts.crypt_algo == CryptAlgo::Blowfish {
        let key = opts.password.as_deref().ok_or(CryptoError::MissingKey)?;
        crypto::encrypt_block(key, &mut block.data)?;
        block.crypt_algo = CryptAlgo::Blowfish;
        block.archive_size = block.data.len() as u64;
    } else {
        block.crypt_algo = CryptAlgo::None;
    }

    // Final checksum covers the bytes exactly as they will hit the archive.
    block.checksum = fletcher32(&block.data);
    Ok(())
}

// ── Read direction ───────────────────────────────────────────────────────────

/// Verify, decrypt and decompress an archived block in place.
///
/// Returns [`BlockHealth::Corrupt`] when the block was zero-filled; only
/// structural problems (missing key, length mismatch, unavailable codec)
/// are errors.
pub fn decompress_block(
    block: &mut BlockInfo,
    opts: &ArchiveOptions,
    codecs: &dyn CodecProvider,
) -> Result<BlockHealth, TransformError> {
    let realsize = block.real_size as usize;
    let mut dest = vec![0u8; realsize];

    // Checksum first: it covers the on-archive form, so cipher and codec
    // never run on bytes that are already known bad.
    if fletcher32(&block.data) != block.checksum {
        warn!(
            offset = block.offset,
            size = block.real_size,
            "block checksum mismatch, zero-filling"
        );
        block.data = dest;
        return Ok(BlockHealth::Corrupt);
    }

    if block.crypt_algo != CryptAlgo::None {
        let key = match (&opts.password, opts.crypt_algo) {
            (Some(key), CryptAlgo::Blowfish) => key.as_slice(),
            _ => return Err(CryptoError::MissingKey.into()),
        };
        crypto::decrypt_block(key, &mut block.data)?;
        let clearsize = block.data.len() as u64;
        if clearsize != block.comp_size {
            return Err(CryptoError::LengthMismatch {
                expected: block.comp_size,
                actual: clearsize,
            }
            .into());
        }
    }

    let health = match block.comp_algo {
        CompressAlgo::None => {
            if block.data.len() == realsize {
                dest.copy_from_slice(&block.data);
                BlockHealth::Intact
            } else {
                warn!(offset = block.offset, "stored block has the wrong length, zero-filling");
                BlockHealth::Corrupt
            }
        }
        algo => {
            let codec = codecs.resolve(algo)?;
            match codec.decode(&block.data, &mut dest) {
                Ok(n) if n == realsize => BlockHealth::Intact,
                Ok(n) => {
                    warn!(
                        offset = block.offset,
                        expected = realsize,
                        got = n,
                        "decoder returned a short block, zero-filling"
                    );
                    dest.iter_mut().for_each(|b| *b = 0);
                    BlockHealth::Corrupt
                }
                Err(e) => {
                    warn!(offset = block.offset, error = %e, "decoder failed, zero-filling");
                    dest.iter_mut().for_each(|b| *b = 0);
                    BlockHealth::Corrupt
                }
            }
        }
    };

    block.data = dest;
    Ok(health)
}

// ── Worker loop ──────────────────────────────────────────────────────────────

/// Body of one transformer thread: claim TODO blocks until the queue drains.
/// A fatal transformation error tells the producer to stop and exits the
/// worker; the block it owned stays IN_PROGRESS until teardown.
pub fn transform_worker(ctx: &PipelineContext, direction: TransformDirection) {
    while !ctx.queue.is_drained() {
        let (itemnum, mut block) = match ctx.queue.claim_next_todo() {
            Ok(claimed) => claimed,
            Err(QueueError::EndOfQueue) => break,
            Err(e) => {
                error!(error = %e, "transformer could not claim a block");
                ctx.control.set_stopfillqueue();
                ctx.control.request_abort();
                return;
            }
        };

        let result = match direction {
            TransformDirection::Compress => {
                compress_block(&mut block, &ctx.options, ctx.codecs.as_ref())
                    .map(|()| BlockHealth::Intact)
            }
            TransformDirection::Decompress => {
                decompress_block(&mut block, &ctx.options, ctx.codecs.as_ref())
            }
        };

        match result {
            Ok(health) => {
                if health == BlockHealth::Corrupt {
                    ctx.stats.count_corrupt_block();
                }
                // NotFound here is normal: the consumer may have torn the
                // item down during shutdown.
                let _ = ctx.queue.complete_block(itemnum, block);
            }
            Err(e) => {
                // The claimed block stays IN_PROGRESS; raising abort keeps
                // the consumer from waiting on it forever.
                error!(itemnum, error = %e, "block transformation failed");
                ctx.control.set_stopfillqueue();
                ctx.control.request_abort();
                return;
            }
        }
    }
    debug!("transformer exit");
}
