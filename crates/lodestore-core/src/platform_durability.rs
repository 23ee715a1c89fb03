//! Platform-specific durable sync
//!
//! Maps "make these bytes survive power loss" onto the strongest primitive
//! each platform offers.

use std::fs::File;
use std::io;
use std::path::Path;

/// Flush file data to persistent media before returning.
///
/// - Linux: `fdatasync()`
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`; plain `fsync` stops at the drive cache there
/// - Windows: `FlushFileBuffers()`
/// - elsewhere: `File::sync_data()`
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File` borrow.
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
        // SAFETY: the descriptor comes from a live `File` borrow.
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
        // SAFETY: the handle comes from a live `File` borrow.
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

/// Persist directory entries (file creation, deletion) on platforms that need it.
///
/// Windows cannot open directories as files; entry metadata is journaled there.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        handle.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"frame bytes").unwrap();
        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }

    #[test]
    fn test_sync_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(sync_directory(dir.path()).is_ok());
    }
}
