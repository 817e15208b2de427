//! Restore consumer: applies dequeued items to a destination directory.
//!
//! Items arrive in strict archive order, so the stream itself is the state
//! machine: an object record for a regular file opens it, the following
//! blocks append to it, and the file-end record closes and verifies it
//! (BLAKE3 content hash plus byte counts).  Verification failures and
//! unreadable objects are counted, never fatal; only structural problems
//! (missing key, unsupported version, queue misuse) abort the restore.
//!
//! Directory permission bits are applied after the stream ends, deepest
//! path first, so a read-only directory cannot block the restore of its
//! own children.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::crypto::CryptoError;
use crate::dico::Dico;
use crate::format::{
    fileend, mainhead, object, CryptAlgo, FormatError, ObjType, FORMAT_VERSION, MAGIC_DATAEND,
    MAGIC_FILEEND, MAGIC_FSBEGIN, MAGIC_FSEND, MAGIC_MAIN, MAGIC_OBJECT,
};
use crate::pipeline::{PipelineContext, PipelineError};
use crate::queue::{BlockInfo, HeadInfo, ItemKind, QueueError};

/// Consumer loop of the restore direction.
pub fn consume(ctx: &PipelineContext, dest: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(dest)?;
    let mut restorer = Restorer {
        ctx,
        dest: dest.to_path_buf(),
        current: None,
        dir_modes: Vec::new(),
    };

    loop {
        match ctx.queue.peek_next() {
            Ok(ItemKind::Header(_)) => {
                let (_, head) = ctx.queue.dequeue_header()?;
                restorer.apply_header(head)?;
            }
            Ok(ItemKind::Block) => {
                let (_, block) = ctx.queue.dequeue_block()?;
                restorer.apply_block(block);
            }
            Err(QueueError::EndOfQueue) => break,
            Err(e) => return Err(e.into()),
        }
    }

    restorer.finish()
}

/// A regular file mid-restore, between its object record and file end.
struct OpenFile {
    file: File,
    abs: PathBuf,
    rel: String,
    /// Size announced by the object record.
    expected_size: Option<u64>,
    written: u64,
    hasher: blake3::Hasher,
    mode: Option<u32>,
    damaged: bool,
}

struct Restorer<'a> {
    ctx: &'a PipelineContext,
    dest: PathBuf,
    current: Option<OpenFile>,
    /// Directory modes applied deepest-first after the stream ends.
    dir_modes: Vec<(PathBuf, u32)>,
}

impl Restorer<'_> {
    fn apply_header(&mut self, head: HeadInfo) -> Result<(), PipelineError> {
        match &head.magic {
            m if m == MAGIC_MAIN => self.check_main(&head.dico),
            m if m == MAGIC_OBJECT => {
                // A new object while a file is open means its end record
                // never arrived.
                if let Some(open) = self.current.take() {
                    self.abandon_file(open);
                }
                self.create_object(&head.dico)
            }
            m if m == MAGIC_FILEEND => {
                match self.current.take() {
                    Some(open) => self.close_file(open, &head.dico),
                    None => warn!("file-end record without an open file"),
                }
                Ok(())
            }
            m if m == MAGIC_FSBEGIN || m == MAGIC_FSEND || m == MAGIC_DATAEND => {
                debug!(magic = %String::from_utf8_lossy(&head.magic), "stream marker");
                Ok(())
            }
            other => {
                warn!(magic = %String::from_utf8_lossy(other), "ignoring unexpected header");
                Ok(())
            }
        }
    }

    /// Validate the archive-wide expectations before data flows.
    fn check_main(&mut self, dico: &Dico) -> Result<(), PipelineError> {
        if let Some(version) = dico.get_u32(mainhead::KEY_VERSION).map_err(FormatError::from)? {
            if version != FORMAT_VERSION {
                return Err(FormatError::UnsupportedVersion(version).into());
            }
        }
        let crypt = dico
            .get_u16(mainhead::KEY_CRYPT_ALGO)
            .map_err(FormatError::from)?
            .and_then(CryptAlgo::from_u16)
            .unwrap_or(CryptAlgo::None);
        if crypt == CryptAlgo::Blowfish && self.ctx.options.password.is_none() {
            return Err(CryptoError::MissingKey.into());
        }
        Ok(())
    }

    fn create_object(&mut self, dico: &Dico) -> Result<(), PipelineError> {
        let raw_type = dico
            .get_u16(object::KEY_TYPE)
            .map_err(FormatError::from)?
            .ok_or(FormatError::MissingKey { magic: "object".into(), key: object::KEY_TYPE })?;
        let objtype = ObjType::from_u16(raw_type)
            .ok_or_else(|| FormatError::Corrupt(format!("unknown object type {raw_type}")))?;
        let rel = String::from_utf8_lossy(
            dico.get_bytes(object::KEY_PATH)
                .map_err(FormatError::from)?
                .ok_or(FormatError::MissingKey { magic: "object".into(), key: object::KEY_PATH })?,
        )
        .into_owned();

        let Some(abs) = safe_join(&self.dest, &rel) else {
            warn!(path = %rel, "refusing to restore outside the destination");
            self.ctx.stats.count_err(objtype);
            return Ok(());
        };
        let mode = dico.get_u32(object::KEY_MODE).map_err(FormatError::from)?;

        match objtype {
            ObjType::Dir => match fs::create_dir_all(&abs) {
                Ok(()) => {
                    if let Some(mode) = mode {
                        self.dir_modes.push((abs, mode));
                    }
                    self.ctx.stats.count_ok(ObjType::Dir);
                }
                Err(e) => {
                    warn!(path = %rel, error = %e, "cannot create directory");
                    self.ctx.stats.count_err(ObjType::Dir);
                }
            },
            ObjType::RegFile => {
                if let Some(parent) = abs.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                match File::create(&abs) {
                    Ok(file) => {
                        self.current = Some(OpenFile {
                            file,
                            abs,
                            rel,
                            expected_size: dico
                                .get_uint(object::KEY_SIZE)
                                .map_err(FormatError::from)?,
                            written: 0,
                            hasher: blake3::Hasher::new(),
                            mode,
                            damaged: false,
                        });
                    }
                    Err(e) => {
                        warn!(path = %rel, error = %e, "cannot create file");
                        self.ctx.stats.count_err(ObjType::RegFile);
                    }
                }
            }
            ObjType::Symlink => self.create_symlink(dico, &rel, &abs)?,
            ObjType::Hardlink => self.create_hardlink(dico, &rel, &abs)?,
            ObjType::CharDev | ObjType::BlockDev | ObjType::Fifo | ObjType::Socket => {
                self.create_special(objtype, dico, &rel, &abs, mode)?;
            }
        }
        Ok(())
    }

    fn link_target(&self, dico: &Dico) -> Result<Option<String>, PipelineError> {
        Ok(dico
            .get_bytes(object::KEY_LINK_TARGET)
            .map_err(FormatError::from)?
            .map(|b| String::from_utf8_lossy(b).into_owned()))
    }

    fn create_symlink(&mut self, dico: &Dico, rel: &str, abs: &Path) -> Result<(), PipelineError> {
        let Some(target) = self.link_target(dico)? else {
            warn!(path = rel, "symlink record without a target");
            self.ctx.stats.count_err(ObjType::Symlink);
            return Ok(());
        };
        #[cfg(unix)]
        let res = std::os::unix::fs::symlink(&target, abs);
        #[cfg(not(unix))]
        let res = Err::<(), _>(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlinks not supported on this platform",
        ));
        match res {
            Ok(()) => self.ctx.stats.count_ok(ObjType::Symlink),
            Err(e) => {
                warn!(path = rel, link = %target, error = %e, "cannot create symlink");
                self.ctx.stats.count_err(ObjType::Symlink);
            }
        }
        let _ = abs;
        Ok(())
    }

    fn create_hardlink(&mut self, dico: &Dico, rel: &str, abs: &Path) -> Result<(), PipelineError> {
        let Some(target) = self.link_target(dico)? else {
            warn!(path = rel, "hardlink record without a target");
            self.ctx.stats.count_err(ObjType::Hardlink);
            return Ok(());
        };
        let Some(target_abs) = safe_join(&self.dest, &target) else {
            warn!(path = rel, link = %target, "hardlink target escapes the destination");
            self.ctx.stats.count_err(ObjType::Hardlink);
            return Ok(());
        };
        match fs::hard_link(&target_abs, abs) {
            Ok(()) => self.ctx.stats.count_ok(ObjType::Hardlink),
            Err(e) => {
                warn!(path = rel, link = %target, error = %e, "cannot create hardlink");
                self.ctx.stats.count_err(ObjType::Hardlink);
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn create_special(
        &mut self,
        objtype: ObjType,
        dico: &Dico,
        rel: &str,
        abs: &Path,
        mode: Option<u32>,
    ) -> Result<(), PipelineError> {
        let rdev = dico
            .get_uint(object::KEY_RDEV)
            .map_err(FormatError::from)?
            .unwrap_or(0);
        match make_special_node(abs, objtype, mode.unwrap_or(0o644), rdev) {
            Ok(()) => self.ctx.stats.count_ok(objtype),
            Err(e) => {
                // Device nodes usually need privileges; count and carry on.
                warn!(path = rel, kind = objtype.name(), error = %e, "cannot create special node");
                self.ctx.stats.count_err(objtype);
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn create_special(
        &mut self,
        objtype: ObjType,
        _dico: &Dico,
        rel: &str,
        _abs: &Path,
        _mode: Option<u32>,
    ) -> Result<(), PipelineError> {
        warn!(path = rel, kind = objtype.name(), "special nodes unsupported on this platform");
        self.ctx.stats.count_err(objtype);
        Ok(())
    }

    fn apply_block(&mut self, block: BlockInfo) {
        let Some(open) = self.current.as_mut() else {
            warn!(offset = block.offset, "data block without an open file");
            return;
        };
        if block.offset != open.written {
            warn!(
                path = %open.rel,
                expected = open.written,
                got = block.offset,
                "block offset out of sequence"
            );
            open.damaged = true;
        }
        open.hasher.update(&block.data);
        if let Err(e) = open.file.write_all(&block.data) {
            warn!(path = %open.rel, error = %e, "write failed");
            open.damaged = true;
        }
        open.written += block.data.len() as u64;
    }

    /// Verify a completed file against its end record and close it.
    fn close_file(&mut self, open: OpenFile, end: &Dico) {
        let recorded_hash = end.get_bytes(fileend::KEY_CONTENT_HASH).ok().flatten();
        let recorded_size = end.get_uint(fileend::KEY_SIZE).ok().flatten();
        let actual_hash = open.hasher.finalize();

        let intact = !open.damaged
            && recorded_size == Some(open.written)
            && open.expected_size.map_or(true, |s| s == open.written)
            && recorded_hash == Some(actual_hash.as_bytes().as_slice());

        if intact {
            #[cfg(unix)]
            if let Some(mode) = open.mode {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&open.abs, fs::Permissions::from_mode(mode));
            }
            self.ctx.stats.count_ok(ObjType::RegFile);
        } else {
            warn!(
                path = %open.rel,
                written = open.written,
                "restored file failed verification"
            );
            self.ctx.stats.count_err(ObjType::RegFile);
        }
    }

    /// A file whose end record never arrived.
    fn abandon_file(&mut self, open: OpenFile) {
        warn!(path = %open.rel, "object stream truncated mid-file");
        self.ctx.stats.count_err(ObjType::RegFile);
    }

    /// Flush pending state after the stream ends.
    fn finish(&mut self) -> Result<(), PipelineError> {
        if let Some(open) = self.current.take() {
            self.abandon_file(open);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            self.dir_modes
                .sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
            for (path, mode) in self.dir_modes.drain(..) {
                let _ = fs::set_permissions(&path, fs::Permissions::from_mode(mode));
            }
        }
        Ok(())
    }
}

/// Join an archive-relative path onto `dest`, rejecting anything that could
/// escape it (absolute paths, `..` components).
fn safe_join(dest: &Path, rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    let mut out = dest.to_path_buf();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(unix)]
fn make_special_node(
    abs: &Path,
    objtype: ObjType,
    mode: u32,
    rdev: u64,
) -> std::io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cpath = CString::new(abs.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let kind = match objtype {
        ObjType::Fifo => libc::S_IFIFO,
        ObjType::CharDev => libc::S_IFCHR,
        ObjType::BlockDev => libc::S_IFBLK,
        ObjType::Socket => libc::S_IFSOCK,
        _ => unreachable!("not a special node type"),
    };
    let res = unsafe {
        libc::mknod(
            cpath.as_ptr(),
            kind | (mode & 0o7777) as libc::mode_t,
            rdev as libc::dev_t,
        )
    };
    if res != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_blocks_escapes() {
        let dest = Path::new("/restore/here");
        assert_eq!(
            safe_join(dest, "a/b/c"),
            Some(PathBuf::from("/restore/here/a/b/c"))
        );
        assert_eq!(
            safe_join(dest, "./a"),
            Some(PathBuf::from("/restore/here/a"))
        );
        assert_eq!(safe_join(dest, "../evil"), None);
        assert_eq!(safe_join(dest, "a/../../evil"), None);
        assert_eq!(safe_join(dest, "/etc/passwd"), None);
    }
}
