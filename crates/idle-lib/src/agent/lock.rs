//! Single-run lock file
//!
//! Created with `create_new` so only one trigger can hold it. A lock older
//! than the staleness timeout belongs to a crashed run and is taken over.

use crate::error::{IdleError, IdleResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct LockContents {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held lock; the file is removed on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock. `Ok(None)` means a live run holds it.
    pub async fn acquire(path: &Path, stale_after: Duration) -> IdleResult<Option<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        for _ in 0..2 {
            match Self::create(path).await {
                Ok(lock) => return Ok(Some(lock)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !Self::is_stale(path, stale_after).await {
                        debug!(path = %path.display(), "Run lock held by a live run");
                        return Ok(None);
                    }
                    warn!(path = %path.display(), "Removing stale run lock");
                    match fs::remove_file(path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(IdleError::Lock(format!(
                                "cannot remove stale lock {}: {}",
                                path.display(),
                                e
                            )))
                        }
                    }
                }
                Err(e) => {
                    return Err(IdleError::Lock(format!(
                        "cannot create {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        // Another run took over the stale lock between our remove and create
        Ok(None)
    }

    async fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let lock = Self {
            path: path.to_path_buf(),
        };

        let contents = LockContents {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_vec(&contents)?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        Ok(lock)
    }

    /// A lock is stale when its timestamp, or failing that its mtime, is
    /// older than `stale_after`
    async fn is_stale(path: &Path, stale_after: Duration) -> bool {
        let limit = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());

        if let Ok(bytes) = fs::read(path).await {
            if let Ok(contents) = serde_json::from_slice::<LockContents>(&bytes) {
                return Utc::now() - contents.acquired_at > limit;
            }
        }

        match fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified
                .elapsed()
                .map(|age| age > stale_after)
                .unwrap_or(false),
            // Vanished while we looked; let the next attempt create it
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_second_acquire_is_refused_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.lock");

        let first = RunLock::acquire(&path, Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert!(RunLock::acquire(&path, Duration::from_secs(600))
            .await
            .unwrap()
            .is_none());

        drop(first);
        assert!(!path.exists());
        assert!(RunLock::acquire(&path, Duration::from_secs(600))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.lock");
        let crashed = LockContents {
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(&path, serde_json::to_vec(&crashed).unwrap()).unwrap();

        let lock = RunLock::acquire(&path, Duration::from_secs(600))
            .await
            .unwrap();
        assert!(lock.is_some());

        let contents: LockContents =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(contents.pid, std::process::id());
    }

    #[tokio::test]
    async fn test_creates_missing_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run/idlewatch/agent.lock");

        let lock = RunLock::acquire(&path, Duration::from_secs(60)).await.unwrap();
        assert_eq!(lock.unwrap().path(), path.as_path());
    }
}
