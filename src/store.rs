use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::config::{self, QueueConfig};
use crate::error::{QueueError, Result};
use crate::job::Snapshot;
use crate::lock::{LockGuard, LockManager};
use crate::paths::Layout;

/// The persisted job set, DLQ and configuration. Every access goes through
/// the injected [`LockManager`]; `load` and `save` demand a live guard.
#[derive(Clone, Debug)]
pub struct Store {
    jobs_path: PathBuf,
    config_path: PathBuf,
    lock: LockManager,
}

impl Store {
    pub fn new(layout: &Layout, lock: LockManager) -> Self {
        Self {
            jobs_path: layout.jobs_path(),
            config_path: layout.config_path(),
            lock,
        }
    }

    pub fn open(layout: &Layout) -> Self {
        Self::new(layout, LockManager::new(layout.lock_path()))
    }

    pub fn load(&self, _guard: &LockGuard) -> Result<Snapshot> {
        match fs::read(&self.jobs_path) {
            Ok(contents) => serde_json::from_slice(&contents).map_err(|e| QueueError::Corrupt {
                path: self.jobs_path.clone(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Snapshot::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, _guard: &LockGuard, snapshot: &Snapshot) -> Result<()> {
        let contents = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.jobs_path, &contents)
    }

    /// Load, let `f` transition the snapshot, and save it, all under one
    /// lock acquisition. Nothing is written if `f` fails.
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&mut Snapshot, &QueueConfig) -> Result<T>,
    ) -> Result<T> {
        let guard = self.lock.acquire()?;
        let config = config::load(&self.config_path)?;
        let mut snapshot = self.load(&guard)?;
        let value = f(&mut snapshot, &config)?;
        self.save(&guard, &snapshot)?;
        guard.release();
        Ok(value)
    }

    /// Read-only projection. Still locked so a concurrent save is never
    /// observed half way.
    pub fn read<T>(&self, f: impl FnOnce(&Snapshot, &QueueConfig) -> T) -> Result<T> {
        let guard = self.lock.acquire()?;
        let config = config::load(&self.config_path)?;
        let snapshot = self.load(&guard)?;
        Ok(f(&snapshot, &config))
    }

    pub fn update_config<T>(&self, f: impl FnOnce(&mut QueueConfig) -> Result<T>) -> Result<T> {
        self.lock.with_lock(|| {
            let mut config = config::load(&self.config_path)?;
            let value = f(&mut config)?;
            config::save(&self.config_path, &config)?;
            Ok(value)
        })
    }
}

/// Replace `path` with `contents` so readers see either the old file or the
/// new one: write a sibling temp file, fsync it, then rename over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{file_name}.{}-{}.tmp",
        std::process::id(),
        crate::id::short_token()
    ));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }

    // Persist the rename itself. Not every platform can fsync a directory.
    if let Ok(dir) = File::open(parent)
        && let Err(e) = dir.sync_all()
    {
        tracing::debug!(path = %parent.display(), error = %e, "directory fsync failed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store(tmp: &tempfile::TempDir) -> Store {
        let layout = Layout::under(tmp.path());
        layout.ensure_dirs().unwrap();
        Store::open(&layout)
    }

    #[test]
    fn test_missing_store_loads_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = store(&tmp);
        let snapshot = store.read(|s, _| s.clone()).unwrap();
        assert_eq!(snapshot, Snapshot::default());
    }

    #[test]
    fn test_transact_persists_snapshot() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = store(&tmp);

        let job = store
            .transact(|s, _| Ok(s.enqueue("echo hi".to_string(), 1, Utc::now())))
            .unwrap();

        let reopened = Store::open(&Layout::under(tmp.path()));
        let snapshot = reopened.read(|s, _| s.clone()).unwrap();
        assert_eq!(snapshot.jobs, vec![job]);
        assert!(!Layout::under(tmp.path()).lock_path().exists());
    }

    #[test]
    fn test_failed_transaction_writes_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = store(&tmp);

        let result: Result<()> = store.transact(|s, _| {
            s.enqueue("lost".to_string(), 0, Utc::now());
            Err(QueueError::JobNotFound {
                id: "x".to_string(),
            })
        });
        assert!(result.is_err());
        assert!(!Layout::under(tmp.path()).jobs_path().exists());
    }

    #[test]
    fn test_corrupt_store_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = store(&tmp);
        fs::write(Layout::under(tmp.path()).jobs_path(), "{not json").unwrap();

        let err = store.read(|_, _| ()).unwrap_err();
        assert!(matches!(err, QueueError::Corrupt { .. }));
    }

    #[test]
    fn test_write_atomic_replaces_and_cleans_up() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("file.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("file.json")]);
    }

    #[test]
    fn test_update_config_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = store(&tmp);

        store
            .update_config(|c| c.set("max_retries", "9").map(|_| ()))
            .unwrap();
        let max_retries = store.read(|_, c| c.max_retries()).unwrap();
        assert_eq!(max_retries, 9);
    }
}
