//! Single-run lock file in the data directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds {path} (pid {pid} since {since})")]
    Held {
        path: PathBuf,
        pid: u32,
        since: String,
    },
    #[error("failed to create lock file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at: String,
}

/// Held for the duration of a run; the file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Create `path` exclusively. A lock older than `stale_after` (or one
    /// that cannot be read) is assumed abandoned and replaced once.
    pub fn acquire(path: impl Into<PathBuf>, stale_after: Duration) -> Result<Self, LockError> {
        let path = path.into();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        pid: std::process::id(),
                        acquired_at: Utc::now().to_rfc3339(),
                    };
                    let body = serde_json::to_vec(&record)
                        .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
                    if let Err(err) = file.write_all(&body) {
                        let _ = fs::remove_file(&path);
                        return Err(io_err(err));
                    }
                    debug!(path = %path.display(), "run lock acquired");
                    return Ok(Self { path: path.clone() });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    match read_record(&path) {
                        Some((record, age)) if age <= stale_after => {
                            return Err(LockError::Held {
                                path: path.clone(),
                                pid: record.pid,
                                since: record.acquired_at,
                            });
                        }
                        stale => {
                            warn!(
                                path = %path.display(),
                                pid = ?stale.as_ref().map(|(r, _)| r.pid),
                                "replacing stale run lock"
                            );
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(io_err(e)),
                            }
                        }
                    }
                }
                Err(err) => return Err(io_err(err)),
            }
        }
        Err(io_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock file reappeared while replacing it",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(?err, path = %self.path.display(), "failed to remove run lock");
        }
    }
}

fn read_record(path: &Path) -> Option<(LockRecord, Duration)> {
    let bytes = fs::read(path).ok()?;
    let record: LockRecord = serde_json::from_slice(&bytes).ok()?;
    let acquired = DateTime::parse_from_rfc3339(&record.acquired_at).ok()?;
    let age = (Utc::now() - acquired.with_timezone(&Utc))
        .to_std()
        .unwrap_or_default();
    Some((record, age))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn second_acquire_is_refused_until_release() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("run.lock");

        let lock = RunLock::acquire(&path, HOUR).unwrap();
        assert!(path.exists());
        let err = RunLock::acquire(&path, HOUR).unwrap_err();
        assert!(matches!(err, LockError::Held { pid, .. } if pid == std::process::id()));

        drop(lock);
        assert!(!path.exists());
        let _again = RunLock::acquire(&path, HOUR).unwrap();
    }

    #[test]
    fn stale_lock_is_replaced() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("run.lock");
        fs::write(
            &path,
            r#"{"pid":1,"acquired_at":"2020-01-01T00:00:00+00:00"}"#,
        )
        .unwrap();
        let lock = RunLock::acquire(&path, HOUR).unwrap();
        let record: LockRecord = serde_json::from_slice(&fs::read(lock.path()).unwrap()).unwrap();
        assert_eq!(record.pid, std::process::id());
    }

    #[test]
    fn garbage_lock_is_replaced() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("run.lock");
        fs::write(&path, b"garbage").unwrap();
        assert!(RunLock::acquire(&path, HOUR).is_ok());
    }
}
