//! Block file capability: positional reads plus serialized appends
//!
//! Every data file talks to disk through a [`BlockFile`]. Two
//! implementations exist: the standard one (append-mode handle, pread-style
//! reads, durable sync) used for all writes, and a memory-mapped read-only
//! one that accelerates the sequential recovery scan. The engine swaps mmap
//! handles back to standard before serving traffic.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{CaskError, CaskResult};
use crate::platform_durability::durable_sync;

/// Which BlockFile implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// Buffered appends + positional reads + durable sync
    Standard,
    /// Read-only memory map; append and sync are rejected
    MmapReadOnly,
}

/// Abstract block I/O over one file.
///
/// Reads may run concurrently from any number of threads. Appends must be
/// serialized by the caller; the engine write lock does this.
pub trait BlockFile: Send + Sync {
    /// Fill `buf` from `offset` as far as the file allows; returns bytes read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> CaskResult<usize>;

    /// Append `buf` at the end of the file; returns bytes written.
    fn append(&self, buf: &[u8]) -> CaskResult<usize>;

    /// Push written data to persistent storage.
    fn sync(&self) -> CaskResult<()>;

    /// Current file size in bytes.
    fn size(&self) -> CaskResult<u64>;

    /// Cut the file down to `len` bytes. Used once, at open, to drop a
    /// torn tail so later appends land where the keydir says they do.
    fn truncate(&self, len: u64) -> CaskResult<()>;
}

/// Open a block file of the requested kind.
pub fn open_block_file(path: &Path, kind: IoKind) -> CaskResult<Box<dyn BlockFile>> {
    match kind {
        IoKind::Standard => Ok(Box::new(StandardBlockFile::open(path)?)),
        IoKind::MmapReadOnly => Ok(Box::new(MmapBlockFile::open(path)?)),
    }
}

/// Standard file-backed block I/O.
///
/// The handle is opened in append mode, so concurrent-looking writes land
/// at the end in write order; positional reads never disturb the cursor.
pub struct StandardBlockFile {
    file: File,
    path: PathBuf,
}

impl StandardBlockFile {
    pub fn open(path: &Path) -> CaskResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| CaskError::Io {
                path: Some(path.to_path_buf()),
                kind: e.kind(),
                message: format!("failed to open data file: {}", e),
            })?;

        Ok(Self { file, path: path.to_path_buf() })
    }
}

impl BlockFile for StandardBlockFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> CaskResult<usize> {
        let mut read = 0usize;
        while read < buf.len() {
            #[cfg(unix)]
            let n = {
                use std::os::unix::fs::FileExt;
                self.file.read_at(&mut buf[read..], offset + read as u64)
            };
            #[cfg(windows)]
            let n = {
                use std::os::windows::fs::FileExt;
                self.file.seek_read(&mut buf[read..], offset + read as u64)
            };

            let n = n.map_err(|e| CaskError::Io {
                path: Some(self.path.clone()),
                kind: e.kind(),
                message: format!("read at offset {} failed: {}", offset + read as u64, e),
            })?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    fn append(&self, buf: &[u8]) -> CaskResult<usize> {
        use std::io::Write;
        (&self.file).write_all(buf).map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("append failed: {}", e),
        })?;
        Ok(buf.len())
    }

    fn sync(&self) -> CaskResult<()> {
        durable_sync(&self.file).map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("durable sync failed: {}", e),
        })
    }

    fn size(&self) -> CaskResult<u64> {
        let meta = self.file.metadata().map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("failed to stat file: {}", e),
        })?;
        Ok(meta.len())
    }

    fn truncate(&self, len: u64) -> CaskResult<()> {
        self.file.set_len(len).map_err(|e| CaskError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("failed to truncate to {} bytes: {}", len, e),
        })
    }
}

/// Read-only memory-mapped block file.
///
/// A zero-length file cannot be mapped, so the map is optional and reads
/// against it report zero bytes.
pub struct MmapBlockFile {
    mmap: Option<Mmap>,
    len: u64,
    path: PathBuf,
}

impl MmapBlockFile {
    pub fn open(path: &Path) -> CaskResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| CaskError::Io {
                path: Some(path.to_path_buf()),
                kind: e.kind(),
                message: format!("failed to open file for mmap: {}", e),
            })?;

        let len = file
            .metadata()
            .map_err(|e| CaskError::Io {
                path: Some(path.to_path_buf()),
                kind: e.kind(),
                message: format!("failed to stat file for mmap: {}", e),
            })?
            .len();

        let mmap = if len == 0 {
            None
        } else {
            // SAFETY: the engine holds the directory lock, and data files are
            // append-only, so mapped bytes are never rewritten underneath us.
            Some(unsafe {
                Mmap::map(&file).map_err(|e| CaskError::Io {
                    path: Some(path.to_path_buf()),
                    kind: e.kind(),
                    message: format!("mmap failed: {}", e),
                })?
            })
        };

        Ok(Self { mmap, len, path: path.to_path_buf() })
    }
}

impl BlockFile for MmapBlockFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> CaskResult<usize> {
        let Some(mmap) = &self.mmap else {
            return Ok(0);
        };
        if offset >= self.len {
            return Ok(0);
        }
        let start = offset as usize;
        let end = (start + buf.len()).min(self.len as usize);
        let n = end - start;
        buf[..n].copy_from_slice(&mmap[start..end]);
        Ok(n)
    }

    fn append(&self, _buf: &[u8]) -> CaskResult<usize> {
        Err(CaskError::ReadOnlyIo { path: self.path.clone(), op: "append" })
    }

    fn sync(&self) -> CaskResult<()> {
        Err(CaskError::ReadOnlyIo { path: self.path.clone(), op: "sync" })
    }

    fn size(&self) -> CaskResult<u64> {
        Ok(self.len)
    }

    fn truncate(&self, _len: u64) -> CaskResult<()> {
        Err(CaskError::ReadOnlyIo { path: self.path.clone(), op: "truncate" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_standard_append_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000000.data");
        let file = StandardBlockFile::open(&path).unwrap();

        assert_eq!(file.append(b"hello ").unwrap(), 6);
        assert_eq!(file.append(b"cask").unwrap(), 4);
        assert_eq!(file.size().unwrap(), 10);

        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(&mut buf, 6).unwrap(), 4);
        assert_eq!(&buf, b"cask");
    }

    #[test]
    fn test_standard_short_read_at_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000000.data");
        let file = StandardBlockFile::open(&path).unwrap();
        file.append(b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 1).unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
        assert_eq!(file.read_at(&mut buf, 99).unwrap(), 0);
    }

    #[test]
    fn test_standard_sync() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000000.data");
        let file = StandardBlockFile::open(&path).unwrap();
        file.append(b"durable").unwrap();
        assert!(file.sync().is_ok());
    }

    #[test]
    fn test_mmap_matches_standard_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000000.data");
        let standard = StandardBlockFile::open(&path).unwrap();
        standard.append(b"the same bytes either way").unwrap();

        let mapped = MmapBlockFile::open(&path).unwrap();
        assert_eq!(mapped.size().unwrap(), standard.size().unwrap());

        let mut a = [0u8; 10];
        let mut b = [0u8; 10];
        standard.read_at(&mut a, 4).unwrap();
        mapped.read_at(&mut b, 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mmap_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000000.data");
        StandardBlockFile::open(&path).unwrap().append(b"x").unwrap();

        let mapped = MmapBlockFile::open(&path).unwrap();
        assert!(matches!(mapped.append(b"y"), Err(CaskError::ReadOnlyIo { op: "append", .. })));
        assert!(matches!(mapped.sync(), Err(CaskError::ReadOnlyIo { op: "sync", .. })));
    }

    #[test]
    fn test_standard_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000000.data");
        let file = StandardBlockFile::open(&path).unwrap();
        file.append(b"keep-this-torn-tail").unwrap();
        file.truncate(9).unwrap();
        assert_eq!(file.size().unwrap(), 9);

        // Appends continue from the truncation point
        file.append(b"!").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"keep-this!");
    }

    #[test]
    fn test_mmap_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000000000.data");
        let mapped = MmapBlockFile::open(&path).unwrap();
        assert_eq!(mapped.size().unwrap(), 0);

        let mut buf = [0u8; 8];
        assert_eq!(mapped.read_at(&mut buf, 0).unwrap(), 0);
    }
}
