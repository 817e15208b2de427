//! Archive creation producer: walks the input paths and feeds the queue.
//!
//! Emission order defines the archive: main header, then per filesystem a
//! begin record, one object record per node in traversal order (regular
//! files followed by their data blocks and a file-end record carrying the
//! BLAKE3 content hash), an end record, and finally the archive footer.
//! Directories are walked in sorted name order so archives are
//! reproducible for a given tree.
//!
//! Unreadable objects are counted as errors and skipped; the stream keeps
//! going.  The producer winds down early when `stopfillqueue` or `abort` is
//! observed, or when the queue reports it was closed under it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::Utc;
use tracing::{debug, warn};

use crate::dico::Dico;
use crate::format::{
    dataend, fileend, fsbegin, fsend, mainhead, object, ObjType, FORMAT_VERSION, FSID_NONE,
    MAGIC_DATAEND, MAGIC_FILEEND, MAGIC_FSBEGIN, MAGIC_FSEND, MAGIC_MAIN, MAGIC_OBJECT,
};
use crate::pipeline::{PipelineContext, PipelineError};
use crate::queue::{BlockInfo, HeadInfo, QueueError, Status};

/// Feed the queue with the complete item stream for `inputs`.
/// The caller closes the queue afterwards (also on error).
pub fn produce(
    ctx: &PipelineContext,
    inputs: &[PathBuf],
    archive_id: u32,
) -> Result<(), PipelineError> {
    let fscount: u16 = if inputs.is_empty() { 0 } else { 1 };
    if !push_header(ctx, main_header(ctx, archive_id, fscount))? {
        return Ok(());
    }

    if !inputs.is_empty() {
        let mut walker = Walker {
            ctx,
            fsid: 0,
            hardlinks: HashMap::new(),
            objcount: 0,
            data_bytes: 0,
        };

        let mut begin = Dico::new();
        if let [single] = inputs {
            begin.set_bytes(fsbegin::KEY_ROOT_PATH, single.to_string_lossy().as_bytes());
        }
        if !push_header(ctx, HeadInfo::new(MAGIC_FSBEGIN, 0, begin))? {
            return Ok(());
        }

        for input in inputs {
            if !walker.walk_root(input)? {
                return Ok(());
            }
        }

        let mut end = Dico::new();
        end.set_u64(fsend::KEY_OBJ_COUNT, walker.objcount);
        end.set_u64(fsend::KEY_BYTES_TOTAL, walker.data_bytes);
        if !push_header(ctx, HeadInfo::new(MAGIC_FSEND, 0, end))? {
            return Ok(());
        }
    }

    let mut foot = Dico::new();
    foot.set_u32(dataend::KEY_ARCHIVE_ID, archive_id);
    push_header(ctx, HeadInfo::new(MAGIC_DATAEND, FSID_NONE, foot))?;
    Ok(())
}

fn main_header(ctx: &PipelineContext, archive_id: u32, fscount: u16) -> HeadInfo {
    let opts = &ctx.options;
    let mut d = Dico::new();
    d.set_u32(mainhead::KEY_VERSION, FORMAT_VERSION);
    d.set_u32(mainhead::KEY_ARCHIVE_ID, archive_id);
    d.set_u64(mainhead::KEY_CREATE_TIME, Utc::now().timestamp().max(0) as u64);
    if let Some(label) = &opts.label {
        d.set_bytes(mainhead::KEY_LABEL, label.as_bytes());
    }
    d.set_u16(mainhead::KEY_FSCOUNT, fscount);
    d.set_u16(mainhead::KEY_COMPRESS_ALGO, opts.compress_algo as u16);
    d.set_u16(mainhead::KEY_CRYPT_ALGO, opts.crypt_algo as u16);
    d.set_u64(mainhead::KEY_BLOCK_SIZE, opts.block_size);
    HeadInfo::new(MAGIC_MAIN, FSID_NONE, d)
}

/// Enqueue a header; `Ok(false)` means the queue was closed under us and the
/// producer should wind down quietly.
fn push_header(ctx: &PipelineContext, head: HeadInfo) -> Result<bool, PipelineError> {
    match ctx.queue.enqueue_header(head) {
        Ok(_) => Ok(true),
        Err(QueueError::EndOfQueue) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn push_block(ctx: &PipelineContext, block: BlockInfo) -> Result<bool, PipelineError> {
    match ctx.queue.enqueue_block(block, Status::Todo) {
        Ok(_) => Ok(true),
        Err(QueueError::EndOfQueue) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

struct Walker<'a> {
    ctx: &'a PipelineContext,
    fsid: u16,
    /// (dev, inode) of already-archived files, for hardlink detection.
    hardlinks: HashMap<(u64, u64), String>,
    objcount: u64,
    data_bytes: u64,
}

impl Walker<'_> {
    /// Archive one top-level input under its file name.
    /// `Ok(false)` propagates an early wind-down.
    fn walk_root(&mut self, input: &Path) -> Result<bool, PipelineError> {
        let rel = match input.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => input.to_string_lossy().trim_matches('/').replace('/', "_"),
        };
        self.visit(input, &rel)
    }

    fn visit(&mut self, abs: &Path, rel: &str) -> Result<bool, PipelineError> {
        if self.ctx.control.interrupted() {
            return Ok(false);
        }
        let meta = match fs::symlink_metadata(abs) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "cannot stat, skipping");
                self.ctx.stats.count_err(ObjType::RegFile);
                return Ok(true);
            }
        };

        let ftype = meta.file_type();
        if ftype.is_dir() {
            self.visit_dir(abs, rel, &meta)
        } else if ftype.is_symlink() {
            self.visit_symlink(abs, rel, &meta)
        } else if ftype.is_file() {
            self.visit_file(abs, rel, &meta)
        } else {
            self.visit_special(abs, rel, &meta)
        }
    }

    fn visit_dir(
        &mut self,
        abs: &Path,
        rel: &str,
        meta: &fs::Metadata,
    ) -> Result<bool, PipelineError> {
        if !self.emit_object(ObjType::Dir, rel, meta, None)? {
            return Ok(false);
        }
        self.ctx.stats.count_ok(ObjType::Dir);

        let mut entries: Vec<PathBuf> = match fs::read_dir(abs) {
            Ok(iter) => iter
                .filter_map(|e| e.ok().map(|e| e.path()))
                .collect(),
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "cannot list directory");
                self.ctx.stats.count_err(ObjType::Dir);
                return Ok(true);
            }
        };
        entries.sort();

        for child in entries {
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !self.visit(&child, &format!("{rel}/{name}"))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn visit_symlink(
        &mut self,
        abs: &Path,
        rel: &str,
        meta: &fs::Metadata,
    ) -> Result<bool, PipelineError> {
        let target = match fs::read_link(abs) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "cannot read symlink");
                self.ctx.stats.count_err(ObjType::Symlink);
                return Ok(true);
            }
        };
        let mut extra = Dico::new();
        extra.set_bytes(object::KEY_LINK_TARGET, target.to_string_lossy().as_bytes());
        if !self.emit_object(ObjType::Symlink, rel, meta, Some(extra))? {
            return Ok(false);
        }
        self.ctx.stats.count_ok(ObjType::Symlink);
        Ok(true)
    }

    fn visit_file(
        &mut self,
        abs: &Path,
        rel: &str,
        meta: &fs::Metadata,
    ) -> Result<bool, PipelineError> {
        // A path we already archived under another name becomes a hardlink.
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = self.hardlinks.get(&key) {
                    let mut extra = Dico::new();
                    extra.set_bytes(object::KEY_LINK_TARGET, first.as_bytes());
                    if !self.emit_object(ObjType::Hardlink, rel, meta, Some(extra))? {
                        return Ok(false);
                    }
                    self.ctx.stats.count_ok(ObjType::Hardlink);
                    return Ok(true);
                }
                self.hardlinks.insert(key, rel.to_owned());
            }
        }

        let mut file = match File::open(abs) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %abs.display(), error = %e, "cannot open file");
                self.ctx.stats.count_err(ObjType::RegFile);
                return Ok(true);
            }
        };

        if !self.emit_object(ObjType::RegFile, rel, meta, None)? {
            return Ok(false);
        }

        let blocksize = self.ctx.options.block_size as usize;
        let mut hasher = blake3::Hasher::new();
        let mut offset = 0u64;
        let mut read_failed = false;
        loop {
            if self.ctx.control.interrupted() {
                return Ok(false);
            }
            let mut buf = vec![0u8; blocksize];
            let n = match read_full(&mut file, &mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!(path = %abs.display(), error = %e, "read failed mid-file");
                    read_failed = true;
                    break;
                }
            };
            if n == 0 {
                break;
            }
            buf.truncate(n);
            hasher.update(&buf);
            if !push_block(self.ctx, BlockInfo::raw(buf, offset))? {
                return Ok(false);
            }
            offset += n as u64;
            if n < blocksize {
                break;
            }
        }

        let mut end = Dico::new();
        end.set_bytes(fileend::KEY_CONTENT_HASH, hasher.finalize().as_bytes().to_vec());
        end.set_u64(fileend::KEY_SIZE, offset);
        if !push_header(
            self.ctx,
            HeadInfo::new(MAGIC_FILEEND, self.fsid, end),
        )? {
            return Ok(false);
        }

        self.data_bytes += offset;
        self.ctx.stats.add_data_bytes(offset);
        if read_failed {
            self.ctx.stats.count_err(ObjType::RegFile);
        } else {
            self.ctx.stats.count_ok(ObjType::RegFile);
        }
        debug!(path = rel, bytes = offset, "file archived");
        Ok(true)
    }

    #[cfg(unix)]
    fn visit_special(
        &mut self,
        _abs: &Path,
        rel: &str,
        meta: &fs::Metadata,
    ) -> Result<bool, PipelineError> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};
        let ftype = meta.file_type();
        let objtype = if ftype.is_fifo() {
            ObjType::Fifo
        } else if ftype.is_socket() {
            ObjType::Socket
        } else if ftype.is_char_device() {
            ObjType::CharDev
        } else if ftype.is_block_device() {
            ObjType::BlockDev
        } else {
            warn!(path = rel, "unknown file type, skipping");
            self.ctx.stats.count_err(ObjType::Fifo);
            return Ok(true);
        };
        let mut extra = Dico::new();
        extra.set_u64(object::KEY_RDEV, meta.rdev());
        if !self.emit_object(objtype, rel, meta, Some(extra))? {
            return Ok(false);
        }
        self.ctx.stats.count_ok(objtype);
        Ok(true)
    }

    #[cfg(not(unix))]
    fn visit_special(
        &mut self,
        _abs: &Path,
        rel: &str,
        _meta: &fs::Metadata,
    ) -> Result<bool, PipelineError> {
        warn!(path = rel, "unsupported file type on this platform, skipping");
        self.ctx.stats.count_err(ObjType::Fifo);
        Ok(true)
    }

    /// Enqueue one object record.  `extra` carries type-specific keys.
    fn emit_object(
        &mut self,
        objtype: ObjType,
        rel: &str,
        meta: &fs::Metadata,
        extra: Option<Dico>,
    ) -> Result<bool, PipelineError> {
        let mut d = extra.unwrap_or_default();
        d.set_u16(object::KEY_TYPE, objtype as u16);
        d.set_bytes(object::KEY_PATH, rel.as_bytes());
        if objtype == ObjType::RegFile {
            d.set_u64(object::KEY_SIZE, meta.len());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            d.set_u32(object::KEY_MODE, meta.mode() & 0o7777);
        }
        if let Ok(mtime) = meta.modified() {
            if let Ok(since) = mtime.duration_since(UNIX_EPOCH) {
                d.set_u64(object::KEY_MTIME, since.as_secs());
            }
        }
        self.objcount += 1;
        push_header(self.ctx, HeadInfo::new(MAGIC_OBJECT, self.fsid, d))
    }
}

/// Read until `buf` is full or EOF; returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
