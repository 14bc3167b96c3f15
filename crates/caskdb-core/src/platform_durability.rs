//! Platform-specific durable sync
//!
//! Sync guarantees differ per platform; this module maps to the strongest
//! primitive available on each: fdatasync on Linux, fcntl(F_FULLFSYNC) on
//! Apple platforms (plain fsync there only reaches the drive's volatile
//! cache), FlushFileBuffers on Windows, and sync_data elsewhere.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensure file data is on persistent storage before returning.
///
/// May block for milliseconds under heavy I/O; callers must not hold locks
/// that readers need while syncing.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fdatasync operates on the open descriptor of a live File.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fcntl(F_FULLFSYNC) operates on the open descriptor of a live File.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: FlushFileBuffers operates on the open handle of a live File.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    {
        file.sync_data()
    }
}

/// Sync a directory so renames and unlinks inside it survive power loss.
///
/// Directory handles cannot be synced on Windows; renames there are left to
/// the filesystem.
pub fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)?;
        dir.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
