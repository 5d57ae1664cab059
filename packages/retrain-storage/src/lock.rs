//! Filesystem mutex serialising pipeline runs across processes.
//!
//! # How It Works
//!
//! 1. Acquisition creates the lock file with `create_new`; only one process
//!    can succeed. The owner's pid is written into it for diagnostics.
//! 2. If the file exists and its mtime is older than the staleness threshold,
//!    the owner is presumed dead: the file is removed and creation retried
//!    immediately.
//! 3. Otherwise the caller polls at a fixed interval until the wait policy
//!    gives up with a `lock_timeout` error.
//! 4. [`LockGuard`] removes the file on `release()` or on drop, so every exit
//!    path (including panics and `?`) frees the lock. The release is recorded
//!    in the status document before the file is removed.
//!
//! Every transition is mirrored into the `lock` section of the status
//! document.
//!
//! # Example
//!
//! ```rust,ignore
//! let guard = locks.acquire(LockWait::Bounded(Duration::from_secs(60)), "manual").await?;
//! // ... run the pipeline ...
//! guard.release()?;
//! ```

use chrono::{DateTime, Utc};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::{iso, Clock};
use crate::error::{IoContext, Result, StorageError};
use crate::manifest::ManifestStore;

/// Default staleness threshold (90 minutes).
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5400);

/// Delay between acquisition attempts while the lock is held.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long `acquire` may wait for a held lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Fail at once if held
    Immediate,
    /// Give up after the duration
    Bounded(Duration),
    /// Wait until the holder releases or goes stale
    Forever,
}

impl LockWait {
    /// `None` waits forever, zero fails immediately, anything else is a bound
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            None => LockWait::Forever,
            Some(d) if d.is_zero() => LockWait::Immediate,
            Some(d) => LockWait::Bounded(d),
        }
    }

    fn limit(&self) -> Option<Duration> {
        match self {
            LockWait::Immediate => Some(Duration::ZERO),
            LockWait::Bounded(d) => Some(*d),
            LockWait::Forever => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub lock_path: PathBuf,
    pub status_path: PathBuf,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl LockConfig {
    pub fn new(lock_path: impl Into<PathBuf>, status_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            status_path: status_path.into(),
            stale_after: DEFAULT_STALE_AFTER,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct LockManager {
    config: LockConfig,
    manifests: Arc<ManifestStore>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(config: LockConfig, manifests: Arc<ManifestStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            manifests,
            clock,
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.config.lock_path
    }

    pub fn is_held(&self) -> bool {
        std::fs::symlink_metadata(&self.config.lock_path).is_ok()
    }

    /// Acquire the lock for `context` (e.g. "manual", "scheduler")
    pub async fn acquire(&self, wait: LockWait, context: &str) -> Result<LockGuard> {
        let started = self.clock.now();
        // A bound too large to represent behaves like waiting forever
        let deadline = wait
            .limit()
            .and_then(|limit| chrono::Duration::from_std(limit).ok())
            .and_then(|limit| started.checked_add_signed(limit));

        loop {
            match self.try_create() {
                Ok(owner_pid) => return Ok(self.acquired(owner_pid, context)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.reclaim_stale()? {
                        continue;
                    }
                    if let Some(deadline) = deadline {
                        if self.clock.now() >= deadline {
                            return Err(StorageError::lock_timeout(
                                &self.config.lock_path,
                                wait.limit(),
                            ));
                        }
                    }
                    debug!(
                        "Lock {} held, retrying in {:?} ({})",
                        self.config.lock_path.display(),
                        self.config.poll_interval,
                        context
                    );
                    self.clock.sleep(self.config.poll_interval).await;
                }
                Err(e) => return Err(StorageError::io(&self.config.lock_path, e)),
            }
        }
    }

    /// Remove the lock if it is older than the staleness threshold.
    ///
    /// Returns `true` when the caller should retry creation at once.
    pub fn reclaim_stale(&self) -> Result<bool> {
        let path = &self.config.lock_path;
        let modified = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta.modified().at(path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(StorageError::io(path, e)),
        };

        let age = self.clock.now() - DateTime::<Utc>::from(modified);
        let is_stale = chrono::Duration::from_std(self.config.stale_after)
            .map_or(false, |stale_after| age > stale_after);
        if !is_stale {
            return Ok(false);
        }

        match std::fs::remove_file(path) {
            Ok(()) => {}
            // Another waiter reclaimed it first
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                error!("Failed to remove stale lock {}: {}", path.display(), e);
                return Ok(false);
            }
        }

        warn!(
            "Removed stale lock file {} ({} seconds old)",
            path.display(),
            age.num_seconds()
        );
        self.record(json!({"lock": {"stale_removed_at": iso(self.clock.now())}}));
        Ok(true)
    }

    fn try_create(&self) -> std::io::Result<u32> {
        let path = &self.config.lock_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let owner_pid = std::process::id();
        file.write_all(owner_pid.to_string().as_bytes())?;
        Ok(owner_pid)
    }

    fn acquired(&self, owner_pid: u32, context: &str) -> LockGuard {
        info!(
            "Acquired lock {} (pid {}, context {})",
            self.config.lock_path.display(),
            owner_pid,
            context
        );
        self.record(json!({
            "lock": {
                "held": true,
                "owner_pid": owner_pid,
                "context": context,
                "acquired_at": iso(self.clock.now()),
            }
        }));

        LockGuard {
            lock_path: self.config.lock_path.clone(),
            status_path: self.config.status_path.clone(),
            manifests: Arc::clone(&self.manifests),
            clock: Arc::clone(&self.clock),
            owner_pid,
            context: context.to_string(),
            released: false,
        }
    }

    fn record(&self, update: serde_json::Value) {
        if let Err(e) = self.manifests.write(&self.config.status_path, update) {
            warn!("Failed to record lock state in status: {}", e);
        }
    }
}

/// Held lock; released explicitly or on drop
pub struct LockGuard {
    lock_path: PathBuf,
    status_path: PathBuf,
    manifests: Arc<ManifestStore>,
    clock: Arc<dyn Clock>,
    owner_pid: u32,
    context: String,
    released: bool,
}

impl LockGuard {
    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Status goes first: once the file is gone the next holder owns the lock section
        let recorded = self.manifests.write(
            &self.status_path,
            json!({
                "lock": {
                    "held": false,
                    "owner_pid": null,
                    "released_at": iso(self.clock.now()),
                }
            }),
        );

        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&self.lock_path, e)),
        }
        info!("Released lock {}", self.lock_path.display());

        recorded.map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release lock {}: {}", self.lock_path.display(), e);
        }
    }
}
