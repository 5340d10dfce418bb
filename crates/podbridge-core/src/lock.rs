//! Node-wide advisory file lock.
//!
//! Plugin invocations are independent processes, so the lock lives in the
//! kernel (`flock(2)`) rather than in memory. It is released when the guard
//! is dropped, or by the kernel if the holder dies.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use podbridge_common::constants::LOCK_POLL_INTERVAL_MS;
use podbridge_common::error::{PodbridgeError, Result};

/// Exclusive hold on a lock file. Dropping it releases the lock.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl FileLock {
    /// Acquires the exclusive lock at `path`, waiting at most `timeout`.
    ///
    /// The file and its parent directory are created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`PodbridgeError::LockTimeout`] if the lock is still held by
    /// another process when the timeout expires, or an I/O error if the
    /// lock file cannot be opened.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PodbridgeError::io(parent, e))?;
        }

        let started = Instant::now();
        let poll = Duration::from_millis(LOCK_POLL_INTERVAL_MS);
        let mut file = open_lock_file(path)?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    tracing::debug!(
                        path = %path.display(),
                        waited_ms = started.elapsed().as_millis(),
                        "lock acquired"
                    );
                    return Ok(Self {
                        path: path.to_path_buf(),
                        _flock: flock,
                    });
                }
                Err((returned, Errno::EAGAIN | Errno::EINTR)) => {
                    file = returned;
                }
                Err((_, errno)) => {
                    return Err(PodbridgeError::io(path, std::io::Error::from(errno)));
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(PodbridgeError::LockTimeout {
                    path: path.to_path_buf(),
                    waited_ms: elapsed.as_millis(),
                });
            }
            tracing::trace!(path = %path.display(), "lock busy, waiting");
            std::thread::sleep(poll.min(timeout - elapsed));
        }
    }

    /// Returns the path of the held lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "lock released");
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| PodbridgeError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_missing_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("fabric.lock");
        let lock = FileLock::acquire(&path, Duration::from_secs(1)).expect("acquire");
        assert_eq!(lock.path(), path);
        assert!(path.exists());
    }

    #[test]
    fn second_holder_times_out_while_first_is_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fabric.lock");
        let _held = FileLock::acquire(&path, Duration::from_secs(1)).expect("first");

        let err = FileLock::acquire(&path, Duration::from_millis(120)).unwrap_err();
        assert!(matches!(err, PodbridgeError::LockTimeout { .. }));
    }

    #[test]
    fn lock_is_reacquirable_after_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fabric.lock");
        drop(FileLock::acquire(&path, Duration::from_secs(1)).expect("first"));
        let _again = FileLock::acquire(&path, Duration::from_millis(200)).expect("second");
    }

    #[test]
    fn waiter_proceeds_once_holder_releases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fabric.lock");
        let held = FileLock::acquire(&path, Duration::from_secs(1)).expect("first");

        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            FileLock::acquire(&waiter_path, Duration::from_secs(5)).map(|_| ())
        });
        std::thread::sleep(Duration::from_millis(150));
        drop(held);

        assert!(waiter.join().expect("join").is_ok());
    }
}
