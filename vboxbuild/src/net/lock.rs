//! Cross-process advisory lock for a host port booking.
//!
//! Concurrent builds on the same host each probe ports; the lock file keeps
//! a probed port booked between closing the probe socket and installing the
//! forwarding rule.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use vboxbuild_shared::errors::{BuildError, BuildResult};

/// Exclusive lock on `<dir>/<port>.lock`, released on drop or process exit.
#[derive(Debug)]
pub struct PortLock {
    #[allow(dead_code)] // Held for lifetime, not directly accessed
    file: File,
    path: PathBuf,
}

impl PortLock {
    /// Try to book `port`. Fails with [`BuildError::Conflict`] when another
    /// build already holds it.
    pub fn acquire(lock_dir: &Path, port: u16) -> BuildResult<Self> {
        std::fs::create_dir_all(lock_dir)
            .map_err(|e| BuildError::Storage(format!("failed to create lock dir: {}", e)))?;

        let lock_path = lock_dir.join(format!("{}.lock", port));

        #[cfg(unix)]
        let file = {
            use std::os::unix::io::AsRawFd;

            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| BuildError::Storage(format!("failed to open lock file: {}", e)))?;

            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(BuildError::Conflict(format!(
                        "port {} is booked by another build",
                        port
                    )));
                }
                return Err(BuildError::Storage(format!(
                    "failed to acquire lock: {}",
                    err
                )));
            }

            // The previous holder unlinks the file before unlocking, so a
            // lock won on an unlinked inode books nothing.
            if !still_linked(&file, &lock_path) {
                return Err(BuildError::Conflict(format!(
                    "port {} was released while booking",
                    port
                )));
            }
            file
        };

        // Without flock the file's existence is the lock.
        #[cfg(not(unix))]
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    BuildError::Conflict(format!("port {} is booked by another build", port))
                }
                _ => BuildError::Storage(format!("failed to open lock file: {}", e)),
            })?;

        tracing::trace!(lock_path = %lock_path.display(), "Acquired port lock");

        Ok(PortLock {
            file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// True when `path` still names the inode `file` has open.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(open), Ok(linked)) => open.dev() == linked.dev() && open.ino() == linked.ino(),
        _ => false,
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            // Unlink while still locked so no other build can lock the
            // inode being removed.
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(lock_path = %self.path.display(), error = %e, "Failed to remove lock file");
            }
            let fd = self.file.as_raw_fd();
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = std::fs::remove_file(&self.path);
        }

        tracing::debug!(lock_path = %self.path.display(), "Released port lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let temp_dir = TempDir::new().unwrap();
        let lock = PortLock::acquire(temp_dir.path(), 2222).unwrap();

        assert!(lock.path().exists());
        assert!(lock.path().ends_with("2222.lock"));
    }

    #[test]
    fn test_second_booking_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let _lock = PortLock::acquire(temp_dir.path(), 3000).unwrap();

        let err = PortLock::acquire(temp_dir.path(), 3000).unwrap_err();
        assert!(err.is_conflict());

        assert!(PortLock::acquire(temp_dir.path(), 3001).is_ok());
    }

    #[test]
    fn test_release_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let path = {
            let lock = PortLock::acquire(temp_dir.path(), 4000).unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(PortLock::acquire(temp_dir.path(), 4000).is_ok());
    }

    #[test]
    fn test_lock_dir_does_not_grow() {
        let temp_dir = TempDir::new().unwrap();
        for port in 5000..5010 {
            drop(PortLock::acquire(temp_dir.path(), port).unwrap());
        }
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_unlinked_inode_is_not_a_booking() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("6000.lock");
        let stale = File::create(&path).unwrap();
        assert!(still_linked(&stale, &path));

        std::fs::remove_file(&path).unwrap();
        assert!(!still_linked(&stale, &path));

        File::create(&path).unwrap();
        assert!(!still_linked(&stale, &path));
    }
}
