//! Cross-process mutual exclusion built on an exclusively-created sentinel
//! file. Workers are independent processes with nothing shared but the
//! filesystem, so acquisition polls instead of blocking on a notification.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use crate::error::{QueueError, Result};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

#[derive(serde::Serialize, serde::Deserialize)]
struct Sentinel {
    token: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

enum Holder {
    Gone,
    Held { age: Duration },
}

#[derive(Clone, Debug)]
pub struct LockManager {
    path: PathBuf,
    stale_after: Duration,
    retry_interval: Duration,
    max_attempts: u32,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stale_after: DEFAULT_STALE_AFTER,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    #[cfg(test)]
    pub fn with_retry(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.retry_interval = interval;
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock, reclaiming a sentinel older than the staleness
    /// threshold. Blocks the calling thread between attempts.
    pub fn acquire(&self) -> Result<LockGuard> {
        let mut attempts = 0;

        loop {
            if let Some(guard) = self.try_create()? {
                tracing::trace!(path = %self.path.display(), attempts, "lock acquired");
                return Ok(guard);
            }

            match self.inspect(&self.path)? {
                Holder::Gone => continue,
                Holder::Held { age } if age > self.stale_after => {
                    if self.reclaim()? {
                        continue;
                    }
                }
                Holder::Held { .. } => {}
            }

            attempts += 1;
            if attempts >= self.max_attempts {
                return Err(QueueError::LockAcquisition {
                    path: self.path.clone(),
                    attempts,
                });
            }
            std::thread::sleep(self.retry_interval);
        }
    }

    /// Run `f` while holding the lock. The lock is released on every exit
    /// path, including errors and panics.
    pub fn with_lock<T, E>(
        &self,
        f: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<QueueError>,
    {
        let _guard = self.acquire()?;
        f()
    }

    fn try_create(&self) -> Result<Option<LockGuard>> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut guard = LockGuard {
            path: self.path.clone(),
            token: crate::id::short_token(),
            written: false,
            released: false,
        };

        let sentinel = Sentinel {
            token: guard.token.clone(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        // The guard drops (and removes the sentinel) if the write fails.
        file.write_all(&serde_json::to_vec(&sentinel)?)?;
        file.sync_all()?;
        guard.written = true;

        Ok(Some(guard))
    }

    fn inspect(&self, path: &Path) -> Result<Holder> {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Gone),
            Err(e) => return Err(e.into()),
        };

        // A sentinel caught between create and write has no parseable body;
        // its mtime still says how long it has existed.
        let acquired_at = match serde_json::from_slice::<Sentinel>(&contents) {
            Ok(sentinel) => SystemTime::from(sentinel.acquired_at),
            Err(_) => match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Gone),
                Err(e) => return Err(e.into()),
            },
        };

        let age = SystemTime::now()
            .duration_since(acquired_at)
            .unwrap_or(Duration::ZERO);
        Ok(Holder::Held { age })
    }

    /// Move the stale sentinel aside and delete it. Renaming first means two
    /// reclaimers cannot both delete: the loser's rename finds nothing, and a
    /// sentinel that turns out to be fresh is linked back into place.
    fn reclaim(&self) -> Result<bool> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lock".to_string());
        let tombstone = self
            .path
            .with_file_name(format!("{file_name}.stale-{}", crate::id::short_token()));

        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let stale = match self.inspect(&tombstone)? {
            Holder::Gone => true,
            Holder::Held { age } => age > self.stale_after,
        };

        if stale {
            tracing::warn!(path = %self.path.display(), "removing stale lock file");
        } else {
            self.restore(&tombstone);
        }

        if let Err(e) = fs::remove_file(&tombstone) {
            tracing::debug!(path = %tombstone.display(), error = %e, "failed to remove lock tombstone");
        }

        Ok(stale)
    }

    /// Link a live sentinel that was moved aside back into place. Returns
    /// false if another process created a new sentinel in between.
    ///
    /// That window is not closed: the holder of the moved sentinel and the
    /// new creator both believe they hold the lock until one releases. It
    /// only opens when a holder releases and a third process re-acquires
    /// between this process's staleness check and its rename.
    fn restore(&self, tombstone: &Path) -> bool {
        match fs::hard_link(tombstone, &self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::error!(path = %self.path.display(), "lock was re-acquired while a live lock file was moved aside; holders may overlap");
                false
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "could not restore live lock file");
                false
            }
        }
    }
}

/// Scoped lock ownership; dropping the guard removes the sentinel.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    /// Whether our sentinel body reached disk.
    written: bool,
    released: bool,
}

impl LockGuard {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match fs::read(&self.path) {
            Ok(contents) => {
                // An unparseable sentinel is ours only if our own write never
                // completed; otherwise it belongs to a new owner mid-write.
                let ours = serde_json::from_slice::<Sentinel>(&contents)
                    .map(|s| s.token == self.token)
                    .unwrap_or(!self.written);
                if !ours {
                    tracing::warn!(path = %self.path.display(), "lock was reclaimed by another process; leaving it in place");
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "lock file already removed");
                return;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read lock file");
                return;
            }
        }

        match fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!(path = %self.path.display(), "lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "lock file already removed");
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to delete lock file");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
