//! Guard against concurrent runs.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

/// Errors on acquiring the [RunLock].
#[derive(Debug, Display, Error)]
pub enum LockError {
    /// Another run holds the lock.
    #[display("Lock file {} already exists, another backup is running", _0.display())]
    AlreadyRunning(#[error(ignore)] PathBuf),
    /// The lock file couldn't be written.
    #[display("Unable to create lock file {}: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
}

/// Marker file holding the PID of the running backup.
///
/// The lock is released when the guard is dropped, so every exit path
/// after a successful [acquire](Self::acquire) removes the marker again.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Creates the marker at `path`.
    ///
    /// The file is created exclusively, an existing marker is never reused.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::AlreadyRunning(path.to_path_buf()));
            }
            Err(source) => {
                return Err(LockError::Create {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let lock = Self {
            path: path.to_path_buf(),
        };
        // on failure the guard drops and removes the half written marker
        write!(file, "{}", std::process::id()).map_err(|source| LockError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!(target: "lock", "Lock file created: {}", path.display());

        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the marker. Same as dropping the guard.
    pub fn release(self) {}
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!(target: "lock", "Lock file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!(target: "lock", "Lock file {} vanished before release", self.path.display())
            }
            Err(e) => log::error!(
                target: "lock",
                "Lock file {} couldn't be removed: {e}",
                self.path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        let lock = RunLock::acquire(&path).unwrap();
        let second = RunLock::acquire(&path);

        assert!(matches!(second, Err(LockError::AlreadyRunning(p)) if p == path));
        drop(lock);
    }

    #[test]
    fn acquire_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        RunLock::acquire(&path).unwrap().release();
        assert!(!path.exists());

        let lock = RunLock::acquire(&path).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn marker_holds_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        let _lock = RunLock::acquire(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), std::process::id().to_string());
    }

    #[test]
    fn uncreatable_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join(".lock");

        assert!(matches!(RunLock::acquire(&path), Err(LockError::Create { .. })));
    }

    #[test]
    fn release_tolerates_removed_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        let lock = RunLock::acquire(&path).unwrap();
        fs::remove_file(&path).unwrap();

        lock.release();
    }
}
