//! Cross-process guard for mutating operations on an installation.
//!
//! The lock is a file created with `create_new` in the install directory and
//! holding a small JSON [`LockInfo`]. It is released when the guard drops. A
//! lock older than [`STALE_AFTER`] is assumed to belong to a crashed process
//! and is taken over.

use crate::error::{Result, UpdaterError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

pub const LOCK_FILE: &str = ".update.lock";

/// Age after which a lock is considered abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    /// Operation holding the lock, e.g. `apply` or `rollback`.
    pub operation: String,
}

impl LockInfo {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.acquired_at)
            .to_std()
            .map(|age| age > STALE_AFTER)
            .unwrap_or(false)
    }
}

/// Held lock; removes the lock file on drop.
#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
}

impl InstallLock {
    /// Take the lock of `dir` for `operation`, or fail with [`UpdaterError::Busy`].
    pub fn acquire(dir: &Path, operation: &str) -> Result<Self> {
        fs::create_dir_all(dir).map_err(UpdaterError::fs(dir))?;
        let path = dir.join(LOCK_FILE);
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            operation: operation.to_string(),
        };

        match try_create(&path, &info) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !holder_is_stale(&path)? {
                    return Err(busy(&path));
                }
                warn!(path = %path.display(), "taking over stale update lock");
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(UpdaterError::fs(&path)(err)),
                }
                try_create(&path, &info).map_err(|err| {
                    if err.kind() == io::ErrorKind::AlreadyExists {
                        busy(&path)
                    } else {
                        UpdaterError::fs(&path)(err)
                    }
                })?;
            }
            Err(err) => return Err(UpdaterError::fs(&path)(err)),
        }

        debug!(path = %path.display(), operation, "update lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release update lock");
        }
    }
}

fn try_create(path: &Path, info: &LockInfo) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let written = write_info(&mut file, info).and_then(|()| file.sync_all());
    drop(file);
    discard_on_error(path, written)
}

fn write_info(out: &mut impl Write, info: &LockInfo) -> io::Result<()> {
    let body = serde_json::to_vec(info).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    out.write_all(&body)?;
    out.flush()
}

/// An empty lock file would read as held until it goes stale.
fn discard_on_error(path: &Path, result: io::Result<()>) -> io::Result<()> {
    if result.is_err() {
        if let Err(err) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %err, "failed to remove half-written update lock");
        }
    }
    result
}

/// Unparseable lock files fall back to their modification time.
fn holder_is_stale(path: &Path) -> Result<bool> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        // Released between our attempt and this read.
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(UpdaterError::fs(path)(err)),
    };
    if let Ok(holder) = serde_json::from_slice::<LockInfo>(&bytes) {
        return Ok(holder.is_stale(Utc::now()));
    }
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(UpdaterError::fs(path))?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .map(|age| age > STALE_AFTER)
        .unwrap_or(false))
}

fn busy(path: &Path) -> UpdaterError {
    let holder = fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockInfo>(&bytes).ok());
    match holder {
        Some(holder) => UpdaterError::Busy(format!(
            "{} in progress (pid {}, since {})",
            holder.operation,
            holder.pid,
            holder.acquired_at.to_rfc3339()
        )),
        None => UpdaterError::Busy(format!("lock file {} is held", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let dir = tempdir().unwrap();
        let lock = InstallLock::acquire(dir.path(), "apply").unwrap();
        assert!(lock.path().exists());

        let err = InstallLock::acquire(dir.path(), "rollback").unwrap_err();
        assert!(matches!(&err, UpdaterError::Busy(msg) if msg.contains("apply")), "{err}");

        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
        InstallLock::acquire(dir.path(), "rollback").unwrap();
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let stale = LockInfo {
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::minutes(11),
            operation: "apply".into(),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = InstallLock::acquire(dir.path(), "rollback").unwrap();
        let current: LockInfo =
            serde_json::from_slice(&fs::read(lock.path()).unwrap()).unwrap();
        assert_eq!(current.operation, "rollback");
        assert_eq!(current.pid, std::process::id());
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn half_written_lock_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        fs::write(&path, b"").unwrap();
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            operation: "apply".into(),
        };

        let written = write_info(&mut FullDisk, &info);
        assert!(discard_on_error(&path, written).is_err());
        assert!(!path.exists());
        InstallLock::acquire(dir.path(), "apply").unwrap();
    }

    #[test]
    fn fresh_garbage_lock_counts_as_held() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), "garbage").unwrap();
        assert!(matches!(
            InstallLock::acquire(dir.path(), "apply"),
            Err(UpdaterError::Busy(_))
        ));
    }
}
