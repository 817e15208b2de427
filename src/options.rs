//! Run options: fixed before workers start, read-only afterwards.
//!
//! The original implementation kept these in a process-wide `g_options`;
//! here they are a value carried by the pipeline context, so nothing about
//! a run is ambient.

use thiserror::Error;

use crate::crypto;
use crate::format::{
    CompressAlgo, CryptAlgo, DEFAULT_BLOCK_SIZE, DEFAULT_QUEUE_BLOCKS, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE,
};

/// Upper bound on transformer threads, matching the original's cap.
pub const MAX_JOBS: usize = 32;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("block size {0} out of range ({MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE})")]
    BadBlockSize(u64),
    #[error("job count {0} out of range (1..={MAX_JOBS})")]
    BadJobs(usize),
    #[error("a password requires the blowfish cipher and vice versa")]
    CipherMismatch,
    #[error(transparent)]
    BadPassword(#[from] crypto::CryptoError),
}

/// Options shared by every stage of one archive operation.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Requested codec for data blocks.
    pub compress_algo: CompressAlgo,
    pub compress_level: u8,
    pub crypt_algo: CryptAlgo,
    /// Cipher key material, used as-is (no derivation).
    pub password: Option<Vec<u8>>,
    /// Chunking size for regular-file payloads.
    pub block_size: u64,
    /// Transformer thread count.
    pub jobs: usize,
    /// Soft bound on in-flight blocks in the queue.
    pub queue_blocks: usize,
    /// Volume split threshold in bytes; 0 disables splitting.
    pub volume_size: u64,
    /// Free-form archive label stored in the main header.
    pub label: Option<String>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            compress_algo: CompressAlgo::Gzip,
            compress_level: 6,
            crypt_algo: CryptAlgo::None,
            password: None,
            block_size: DEFAULT_BLOCK_SIZE,
            jobs: default_jobs(),
            queue_blocks: DEFAULT_QUEUE_BLOCKS,
            volume_size: 0,
            label: None,
        }
    }
}

impl ArchiveOptions {
    /// Enable encryption with the given passphrase.
    pub fn with_password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self.crypt_algo = CryptAlgo::Blowfish;
        self
    }

    /// Check internal consistency before a run starts.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.block_size < MIN_BLOCK_SIZE || self.block_size > MAX_BLOCK_SIZE {
            return Err(OptionsError::BadBlockSize(self.block_size));
        }
        if self.jobs < 1 || self.jobs > MAX_JOBS {
            return Err(OptionsError::BadJobs(self.jobs));
        }
        match (&self.password, self.crypt_algo) {
            (Some(pw), CryptAlgo::Blowfish) => crypto::check_key(pw)?,
            (None, CryptAlgo::None) => {}
            _ => return Err(OptionsError::CipherMismatch),
        }
        Ok(())
    }
}

/// One transformer per core, capped.
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_JOBS)
}
