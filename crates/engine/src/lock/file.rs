//! File lock provider
//!
//! For databases without advisory locks. A lock is a file `{key}.lock` inside
//! the lock directory, created with create-exclusive semantics and holding a
//! JSON [`LockFileRecord`]. A lock whose process is gone (same host) or whose
//! age exceeds the staleness threshold is removed and acquisition retried.
//!
//! Removing a lock file, stale or released, happens only while holding an OS
//! lock on the sidecar `{key}.lock.guard`, so no caller can delete a lock file
//! that another caller has just created.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{LockProvider, LockState};
use crate::error::{LockError, LockResult};

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFileRecord {
    pub pid: u32,
    pub hostname: String,
    pub token: String,
    pub timestamp: DateTime<Utc>,
}

impl LockFileRecord {
    pub fn for_current_process(state: &LockState) -> Self {
        Self {
            pid: std::process::id(),
            hostname: current_hostname(),
            token: state.owner_token.clone(),
            timestamp: state.acquired_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileLockProvider {
    lock_dir: PathBuf,
    stale_after: Duration,
}

impl FileLockProvider {
    /// Create the provider, creating and canonicalizing the lock directory.
    pub fn new(lock_dir: impl AsRef<Path>, stale_after: Duration) -> LockResult<Self> {
        std::fs::create_dir_all(lock_dir.as_ref())?;
        let lock_dir = lock_dir.as_ref().canonicalize()?;
        Ok(Self {
            lock_dir,
            stale_after,
        })
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Resolve the lock file for `key`, refusing anything outside the lock directory.
    pub fn lock_path(&self, key: &str) -> LockResult<PathBuf> {
        let valid = !key.is_empty()
            && !key.contains("..")
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(LockError::InvalidKey(key.to_string()));
        }

        let path = self.lock_dir.join(format!("{}.lock", key));
        if path.parent() != Some(self.lock_dir.as_path()) {
            return Err(LockError::PathTraversal(path.display().to_string()));
        }
        Ok(path)
    }

    fn guard_path(&self, key: &str) -> LockResult<PathBuf> {
        let path = self.lock_path(key)?;
        Ok(path.with_file_name(format!("{}.lock.guard", key)))
    }

    async fn create_exclusive(&self, path: &Path, record: &LockFileRecord) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        let payload = serde_json::to_vec(record)?;
        let written = async {
            file.write_all(&payload).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(path).await;
            return Err(e);
        }
        Ok(())
    }

    async fn read_record(&self, path: &Path) -> std::io::Result<Option<LockFileRecord>> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes).ok())
    }

    /// Whether the lock file at `path` may be reclaimed. A missing file counts as stale.
    async fn is_stale(&self, path: &Path) -> LockResult<bool> {
        let record = match self.read_record(path).await {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        match record {
            Some(record) => {
                if record.hostname == current_hostname() && !process_is_running(record.pid) {
                    tracing::warn!(
                        "Lock file {} belongs to process {} which is no longer running",
                        path.display(),
                        record.pid
                    );
                    return Ok(true);
                }
                let age = Utc::now()
                    .signed_duration_since(record.timestamp)
                    .to_std()
                    .unwrap_or_default();
                Ok(age > self.stale_after)
            }
            None => {
                // Unreadable content, e.g. a writer that has not flushed yet
                let modified = match fs::metadata(path).await {
                    Ok(metadata) => metadata.modified()?,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
                    Err(e) => return Err(e.into()),
                };
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or_default();
                Ok(age > self.stale_after)
            }
        }
    }
}

#[async_trait]
impl LockProvider for FileLockProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn try_acquire(&self, key: &str) -> LockResult<Option<LockState>> {
        let path = self.lock_path(key)?;
        let state = LockState::new(key);
        let record = LockFileRecord::for_current_process(&state);

        match self.create_exclusive(&path, &record).await {
            Ok(()) => return Ok(Some(state)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        // Someone else is judging this lock file right now
        let Some(_guard) = GuardFile::acquire(self.guard_path(key)?, false).await? else {
            return Ok(None);
        };

        if !self.is_stale(&path).await? {
            return Ok(None);
        }
        tracing::warn!("Removing stale lock file {}", path.display());
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match self.create_exclusive(&path, &record).await {
            Ok(()) => Ok(Some(state)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, key: &str, token: &str) -> LockResult<bool> {
        let path = self.lock_path(key)?;
        let _guard = GuardFile::acquire(self.guard_path(key)?, true).await?;

        let record = match self.read_record(&path).await {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if record.as_ref().map(|r| r.token.as_str()) != Some(token) {
            tracing::warn!(
                "Lock file {} is owned by another token, leaving it in place",
                path.display()
            );
            return Ok(false);
        }

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_locked(&self, key: &str) -> LockResult<bool> {
        let path = self.lock_path(key)?;
        if !fs::try_exists(&path).await? {
            return Ok(false);
        }
        Ok(!self.is_stale(&path).await?)
    }
}

/// Exclusive OS lock on a guard file, released on drop.
///
/// The guard file itself is never removed; deleting a locked file would let
/// the next caller lock a different inode.
struct GuardFile {
    file: std::fs::File,
}

impl GuardFile {
    /// `Ok(None)` when `wait` is false and another caller holds the guard.
    async fn acquire(path: PathBuf, wait: bool) -> LockResult<Option<Self>> {
        let guard = tokio::task::spawn_blocking(move || -> std::io::Result<Option<Self>> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            if wait {
                file.lock_exclusive()?;
                return Ok(Some(Self { file }));
            }
            match file.try_lock_exclusive() {
                Ok(()) => Ok(Some(Self { file })),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| std::io::Error::new(ErrorKind::Other, e))??;
        Ok(guard)
    }
}

impl Drop for GuardFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn current_hostname() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

fn process_is_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system.process(pid).is_some()
}
