//! Cross-process exclusion for the registry file.
//!
//! An advisory `flock(LOCK_EX)` on `registry.lock`, held only for one
//! read-reconcile-write sequence. The lock is tied to the open file
//! description, so it is released when the guard drops, and also by the
//! kernel if the holder crashes mid-sequence.
//!
//! Separate `open` calls get separate descriptions, so two threads in one
//! process exclude each other the same way two processes do.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{MountError, Result};

pub(crate) const LOCK_ATTEMPTS: u32 = 100;
pub(crate) const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Holds the registry lock until dropped.
#[derive(Debug)]
pub(crate) struct RegistryLock {
    file: File,
    path: PathBuf,
}

impl RegistryLock {
    /// Acquires the lock, retrying a bounded number of times.
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        Self::acquire_with(path, LOCK_ATTEMPTS, LOCK_RETRY_INTERVAL)
    }

    pub(crate) fn acquire_with(path: &Path, attempts: u32, interval: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|e| MountError::io("create registry directory", e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| MountError::io(format!("open {}", path.display()), e))?;

        for attempt in 1..=attempts.max(1) {
            match try_flock_exclusive(&file) {
                Ok(true) => {
                    return Ok(RegistryLock {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Ok(false) => {
                    if attempt < attempts {
                        thread::sleep(interval);
                    }
                }
                Err(e) => return Err(MountError::io(format!("flock {}", path.display()), e)),
            }
        }

        Err(MountError::RegistryBusy {
            path: path.to_path_buf(),
            attempts,
        })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(err) = unlock(&self.file) {
            // Closing the descriptor releases it anyway.
            tracing::debug!(path = %self.path.display(), error = %err, "Explicit registry unlock failed");
        }
    }
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if another holder has it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is a valid descriptor owned by `file` for the duration of the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

fn unlock(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is a valid descriptor owned by `file`.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}
