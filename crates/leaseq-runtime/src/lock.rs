//! Whole-file advisory lock serializing access to the durable log.
//!
//! Every process sharing a log takes this lock around each read-modify-append
//! sequence, so no two log operations overlap system-wide. The lock is
//! released when the guard drops.

use crate::error::QueueError;
use std::fs::File;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Held exclusive lock on an open log file
#[derive(Debug)]
pub struct LogLock<'a> {
    file: &'a File,
}

impl<'a> LogLock<'a> {
    /// Block until the exclusive lock on `file` is acquired
    #[cfg(unix)]
    pub fn exclusive(file: &'a File) -> Result<Self, QueueError> {
        loop {
            let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if res == 0 {
                return Ok(Self { file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(QueueError::io("lock", err));
            }
        }
    }

    #[cfg(not(unix))]
    pub fn exclusive(file: &'a File) -> Result<Self, QueueError> {
        tracing::warn!("File locking unsupported on this platform; log access is not serialized");
        Ok(Self { file })
    }
}

impl Drop for LogLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            let res = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
            if res != 0 {
                tracing::warn!(
                    error = %std::io::Error::last_os_error(),
                    "Failed to release log lock"
                );
            }
        }
        #[cfg(not(unix))]
        let _ = self.file;
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
