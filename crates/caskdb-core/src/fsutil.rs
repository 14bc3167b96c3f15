//! Filesystem helpers: directory sizing, copying, free-space queries

use std::fs;
use std::path::Path;

use crate::error::{CaskError, CaskResult};

/// Total size in bytes of every regular file under `dir`, recursively.
pub fn dir_size(dir: &Path) -> CaskResult<u64> {
    let mut size = 0u64;
    let entries = fs::read_dir(dir).map_err(|e| CaskError::Io {
        path: Some(dir.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read directory: {}", e),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| CaskError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to read directory entry: {}", e),
        })?;
        let meta = entry.metadata().map_err(|e| CaskError::Io {
            path: Some(entry.path()),
            kind: e.kind(),
            message: format!("failed to stat entry: {}", e),
        })?;
        if meta.is_dir() {
            size += dir_size(&entry.path())?;
        } else {
            size += meta.len();
        }
    }
    Ok(size)
}

/// Whether `dir` holds nothing besides the names in `exclude`.
pub fn dir_is_empty(dir: &Path, exclude: &[&str]) -> CaskResult<bool> {
    let entries = fs::read_dir(dir).map_err(|e| CaskError::Io {
        path: Some(dir.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read directory: {}", e),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| CaskError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to read directory entry: {}", e),
        })?;
        let name = entry.file_name();
        let excluded = name.to_str().map(|n| exclude.contains(&n)).unwrap_or(false);
        if !excluded {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Copy the contents of `src` into `dst` (created if absent), skipping
/// top-level entries named in `exclude`.
pub fn copy_dir(src: &Path, dst: &Path, exclude: &[&str]) -> CaskResult<()> {
    fs::create_dir_all(dst).map_err(|e| CaskError::Io {
        path: Some(dst.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to create target directory: {}", e),
    })?;

    let entries = fs::read_dir(src).map_err(|e| CaskError::Io {
        path: Some(src.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read source directory: {}", e),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| CaskError::Io {
            path: Some(src.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to read directory entry: {}", e),
        })?;
        let name = entry.file_name();
        if name.to_str().map(|n| exclude.contains(&n)).unwrap_or(false) {
            continue;
        }

        let target = dst.join(&name);
        let meta = entry.metadata().map_err(|e| CaskError::Io {
            path: Some(entry.path()),
            kind: e.kind(),
            message: format!("failed to stat entry: {}", e),
        })?;
        if meta.is_dir() {
            copy_dir(&entry.path(), &target, &[])?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| CaskError::Io {
                path: Some(target.clone()),
                kind: e.kind(),
                message: format!("failed to copy file: {}", e),
            })?;
        }
    }
    Ok(())
}

/// Bytes available to the store on the volume holding `dir`.
pub fn available_disk_size(dir: &Path) -> CaskResult<u64> {
    fs2::available_space(dir).map_err(|e| CaskError::Io {
        path: Some(dir.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to query available disk space: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dir_size_counts_nested_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b"), vec![0u8; 50]).unwrap();

        assert_eq!(dir_size(dir.path()).unwrap(), 150);
    }

    #[test]
    fn test_dir_is_empty_with_exclusions() {
        let dir = TempDir::new().unwrap();
        assert!(dir_is_empty(dir.path(), &[]).unwrap());

        fs::write(dir.path().join("flock"), b"").unwrap();
        assert!(dir_is_empty(dir.path(), &["flock"]).unwrap());
        assert!(!dir_is_empty(dir.path(), &[]).unwrap());

        fs::write(dir.path().join("000000000.data"), b"x").unwrap();
        assert!(!dir_is_empty(dir.path(), &["flock"]).unwrap());
    }

    #[test]
    fn test_copy_dir_excludes_names() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("keep"), b"data").unwrap();
        fs::write(src.path().join("flock"), b"lock").unwrap();

        let target = dst.path().join("copy");
        copy_dir(src.path(), &target, &["flock"]).unwrap();

        assert!(target.join("keep").exists());
        assert!(!target.join("flock").exists());
        assert_eq!(fs::read(target.join("keep")).unwrap(), b"data");
    }

    #[test]
    fn test_available_disk_size_is_nonzero() {
        let dir = TempDir::new().unwrap();
        assert!(available_disk_size(dir.path()).unwrap() > 0);
    }
}
