//! Per-object-kind success and error counters.
//!
//! Counters are atomics because the producer, the transformer pool and the
//! consumer all contribute (block corruption is detected on a transformer
//! thread, object errors on the producer/consumer).  A run's final exit
//! status is non-zero whenever any error counter is.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::format::ObjType;

#[derive(Debug, Default)]
pub struct Stats {
    cnt_regfile: AtomicU64,
    cnt_dir: AtomicU64,
    cnt_symlink: AtomicU64,
    cnt_hardlink: AtomicU64,
    cnt_special: AtomicU64,
    err_regfile: AtomicU64,
    err_dir: AtomicU64,
    err_symlink: AtomicU64,
    err_hardlink: AtomicU64,
    err_special: AtomicU64,
    /// Blocks zero-filled on restore after a checksum or decoder failure.
    corrupt_blocks: AtomicU64,
    /// Regular-file payload bytes processed.
    data_bytes: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn ok_counter(&self, objtype: ObjType) -> &AtomicU64 {
        match objtype {
            ObjType::RegFile => &self.cnt_regfile,
            ObjType::Dir => &self.cnt_dir,
            ObjType::Symlink => &self.cnt_symlink,
            ObjType::Hardlink => &self.cnt_hardlink,
            ObjType::CharDev | ObjType::BlockDev | ObjType::Fifo | ObjType::Socket => {
                &self.cnt_special
            }
        }
    }

    fn err_counter(&self, objtype: ObjType) -> &AtomicU64 {
        match objtype {
            ObjType::RegFile => &self.err_regfile,
            ObjType::Dir => &self.err_dir,
            ObjType::Symlink => &self.err_symlink,
            ObjType::Hardlink => &self.err_hardlink,
            ObjType::CharDev | ObjType::BlockDev | ObjType::Fifo | ObjType::Socket => {
                &self.err_special
            }
        }
    }

    pub fn count_ok(&self, objtype: ObjType) {
        self.ok_counter(objtype).fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_err(&self, objtype: ObjType) {
        self.err_counter(objtype).fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_corrupt_block(&self) {
        self.corrupt_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_data_bytes(&self, n: u64) {
        self.data_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn corrupt_blocks(&self) -> u64 {
        self.corrupt_blocks.load(Ordering::Relaxed)
    }

    /// Sum of every error counter; a non-zero total forces a non-zero exit.
    pub fn err_total(&self) -> u64 {
        self.err_regfile.load(Ordering::Relaxed)
            + self.err_dir.load(Ordering::Relaxed)
            + self.err_symlink.load(Ordering::Relaxed)
            + self.err_hardlink.load(Ordering::Relaxed)
            + self.err_special.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            regfiles: self.cnt_regfile.load(Ordering::Relaxed),
            directories: self.cnt_dir.load(Ordering::Relaxed),
            symlinks: self.cnt_symlink.load(Ordering::Relaxed),
            hardlinks: self.cnt_hardlink.load(Ordering::Relaxed),
            specials: self.cnt_special.load(Ordering::Relaxed),
            err_regfiles: self.err_regfile.load(Ordering::Relaxed),
            err_directories: self.err_dir.load(Ordering::Relaxed),
            err_symlinks: self.err_symlink.load(Ordering::Relaxed),
            err_hardlinks: self.err_hardlink.load(Ordering::Relaxed),
            err_specials: self.err_special.load(Ordering::Relaxed),
            corrupt_blocks: self.corrupt_blocks.load(Ordering::Relaxed),
            data_bytes: self.data_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value view of [`Stats`] for printing and JSON output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub regfiles: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    pub specials: u64,
    pub err_regfiles: u64,
    pub err_directories: u64,
    pub err_symlinks: u64,
    pub err_hardlinks: u64,
    pub err_specials: u64,
    pub corrupt_blocks: u64,
    pub data_bytes: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "objects processed:...regfiles={}, directories={}, symlinks={}, hardlinks={}, specials={}",
            self.regfiles, self.directories, self.symlinks, self.hardlinks, self.specials
        )?;
        write!(
            f,
            "objects with errors:.regfiles={}, directories={}, symlinks={}, hardlinks={}, specials={}",
            self.err_regfiles,
            self.err_directories,
            self.err_symlinks,
            self.err_hardlinks,
            self.err_specials
        )?;
        if self.corrupt_blocks > 0 {
            write!(f, "\ncorrupt blocks zero-filled: {}", self.corrupt_blocks)?;
        }
        Ok(())
    }
}
