//! Small shared helpers: size formatting, volume paths, archive ids.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

/// Format a byte count with an auto-selected binary unit.
pub fn format_size(size: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    const TIB: u64 = 1024 * GIB;

    if size < KIB {
        format!("{size} bytes")
    } else if size < MIB {
        format!("{:.2} KiB", size as f64 / KIB as f64)
    } else if size < GIB {
        format!("{:.2} MiB", size as f64 / MIB as f64)
    } else if size < TIB {
        format!("{:.2} GiB", size as f64 / GIB as f64)
    } else {
        format!("{:.2} TiB", size as f64 / TIB as f64)
    }
}

/// Append `ext` to `path` unless it already ends with it.
pub fn path_force_extension(path: &Path, ext: &str) -> PathBuf {
    let s = path.as_os_str().to_string_lossy();
    if s.ends_with(ext) {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{s}{ext}"))
    }
}

/// Derive the path of volume `volnum` from the base archive path.
///
/// Volume 0 is the base path itself.  Later volumes replace the final two
/// characters of the base path with a zero-padded volume number:
/// `name.fsa` → `name.f01`, `name.f02`, …
pub fn volume_path(basepath: &Path, volnum: u32) -> io::Result<PathBuf> {
    let base = basepath.as_os_str().to_string_lossy();
    if base.len() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("archive has an invalid base path: {base}"),
        ));
    }
    if volnum == 0 {
        return Ok(basepath.to_path_buf());
    }
    if volnum > 99 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("volume number {volnum} exceeds the 2-digit suffix space"),
        ));
    }
    let prefix = &base[..base.len() - 2];
    Ok(PathBuf::from(format!("{prefix}{volnum:02}")))
}

/// Generate a non-zero archive id from the time of day.
pub fn generate_archive_id() -> u32 {
    loop {
        let now = Utc::now();
        let id = (now.timestamp() as u32) ^ now.timestamp_subsec_micros();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_size_units() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn volume_paths_follow_the_two_digit_rule() {
        let base = Path::new("backup/root.fsa");
        assert_eq!(volume_path(base, 0).unwrap(), base);
        assert_eq!(volume_path(base, 1).unwrap(), Path::new("backup/root.f01"));
        assert_eq!(volume_path(base, 42).unwrap(), Path::new("backup/root.f42"));
        assert!(volume_path(Path::new("x"), 1).is_err());
        assert!(volume_path(base, 100).is_err());
    }

    #[test]
    fn force_extension_is_idempotent() {
        assert_eq!(
            path_force_extension(Path::new("root"), ".fsa"),
            Path::new("root.fsa")
        );
        assert_eq!(
            path_force_extension(Path::new("root.fsa"), ".fsa"),
            Path::new("root.fsa")
        );
    }

    #[test]
    fn archive_ids_are_non_zero() {
        for _ in 0..8 {
            assert_ne!(generate_archive_id(), 0);
        }
    }
}
