//! Process-external lock around network config changes
//!
//! Independent processes race to allocate subnets and device names, so every
//! backend operation holds an exclusive flock(2) on a file in the config
//! directory. The lock is released when the guard is dropped.

use crate::error::{NetworkError, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Lock file shared by all processes using the same config directory.
#[derive(Debug, Clone)]
pub struct NetworkLock {
    path: PathBuf,
}

/// Held lock, unlocked on drop.
pub struct NetworkLockGuard {
    _lock: Flock<File>,
}

impl NetworkLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the exclusive lock is held.
    pub async fn acquire(&self) -> Result<NetworkLockGuard> {
        let path = self.path.clone();
        let guard = tokio::task::spawn_blocking(move || lock_file(&path))
            .await
            .map_err(|e| NetworkError::Internal(format!("lock task failed: {}", e)))??;
        trace!(path = %self.path.display(), "acquired network lock");
        Ok(guard)
    }
}

fn lock_file(path: &Path) -> Result<NetworkLockGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| NetworkError::Context {
            context: format!("open lock file {}", path.display()),
            source: Box::new(NetworkError::Io(e)),
        })?;
    let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
        NetworkError::Internal(format!("failed to lock {}: {}", path.display(), errno))
    })?;
    Ok(NetworkLockGuard { _lock: lock })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = NetworkLock::new(dir.path().join("sub").join("netavark.lock"));
        let guard = lock.acquire().await.unwrap();
        assert!(lock.path().exists());
        drop(guard);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = NetworkLock::new(dir.path().join("netavark.lock"));

        let guard = lock.acquire().await.unwrap();
        let second = lock.clone();
        let waiter = tokio::spawn(async move { second.acquire().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
