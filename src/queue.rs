use chrono::Utc;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::id::JobId;
use crate::job::{DlqEntry, Job, JobState};
use crate::machine::Counts;
use crate::paths::Layout;
use crate::store::Store;

/// Extra time a reserved job may stay Processing beyond its execution
/// timeout before another worker reclaims it. Mirrors the lock's staleness
/// threshold.
pub const LEASE_GRACE: std::time::Duration = crate::lock::DEFAULT_STALE_AFTER;

/// Result of one reservation attempt, with the configuration that was live
/// inside the same critical section.
pub struct Reservation {
    pub job: Option<Job>,
    pub config: QueueConfig,
}

#[derive(Debug, serde::Serialize)]
pub struct Summary {
    #[serde(flatten)]
    pub counts: Counts,
    pub dlq: usize,
}

/// Lock-held queue operations. Each call is one load, transition, save cycle.
#[derive(Clone, Debug)]
pub struct Queue {
    store: Store,
}

impl Queue {
    pub fn open(layout: &Layout) -> Self {
        Self {
            store: Store::open(layout),
        }
    }

    #[cfg(test)]
    pub fn with_lock(layout: &Layout, lock: crate::lock::LockManager) -> Self {
        Self {
            store: Store::new(layout, lock),
        }
    }

    pub fn enqueue(&self, command: &str, max_retries: Option<u32>) -> Result<Job> {
        let job = self.store.transact(|snapshot, config| {
            let max_retries = max_retries.unwrap_or_else(|| config.max_retries());
            Ok(snapshot.enqueue(command.to_string(), max_retries, Utc::now()))
        })?;
        tracing::info!(id = %job.id, command = %job.command, max_retries = job.max_retries, "enqueued job");
        Ok(job)
    }

    /// Reclaim expired leases, then claim the next due job for `worker_id`.
    pub fn reserve(&self, worker_id: &str) -> Result<Reservation> {
        self.store.transact(|snapshot, config| {
            let now = Utc::now();

            for reclaimed in snapshot.reclaim_expired(config.backoff_base(), now) {
                tracing::warn!(
                    id = %reclaimed.id,
                    owner = %reclaimed.worker,
                    state = %reclaimed.state,
                    "reclaimed job with expired lease"
                );
            }

            let lease = chrono::Duration::from_std(config.job_timeout() + LEASE_GRACE)
                .unwrap_or(chrono::Duration::MAX);
            Ok(Reservation {
                job: snapshot.reserve(worker_id, lease, now),
                config: config.clone(),
            })
        })
    }

    pub fn complete(
        &self,
        id: &JobId,
        worker_id: &str,
        output: &str,
        elapsed_sec: f64,
    ) -> Result<bool> {
        self.store.transact(|snapshot, _| {
            Ok(snapshot.complete(id, worker_id, output, elapsed_sec, Utc::now()))
        })
    }

    /// Backoff uses the configuration live at the time of the failure.
    pub fn fail_or_retry(
        &self,
        id: &JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<JobState>> {
        self.store.transact(|snapshot, config| {
            Ok(snapshot.fail_or_retry(id, worker_id, error, config.backoff_base(), Utc::now()))
        })
    }

    pub fn requeue_from_dead(&self, id: &JobId) -> Result<Job> {
        let job = self
            .store
            .transact(|snapshot, _| snapshot.requeue_from_dead(id, Utc::now()))?;
        tracing::info!(id = %job.id, "requeued job from DLQ");
        Ok(job)
    }

    pub fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.store.read(|snapshot, _| snapshot.get(id).cloned())
    }

    pub fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        self.store.read(|snapshot, _| {
            snapshot
                .list_by_state(state)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn job_ids(&self) -> Result<Vec<(JobId, JobState)>> {
        self.store.read(|snapshot, _| {
            snapshot
                .jobs
                .iter()
                .map(|j| (j.id.clone(), j.state))
                .collect()
        })
    }

    pub fn summary(&self) -> Result<Summary> {
        self.store.read(|snapshot, _| Summary {
            counts: snapshot.summary_counts(),
            dlq: snapshot.dlq.len(),
        })
    }

    pub fn dlq(&self) -> Result<Vec<DlqEntry>> {
        self.store.read(|snapshot, _| snapshot.dlq.clone())
    }

    pub fn config(&self) -> Result<QueueConfig> {
        self.store.read(|_, config| config.clone())
    }

    /// Validated single-key update; unknown keys leave the file untouched.
    pub fn set_config(&self, key: &str, value: &str) -> Result<QueueConfig> {
        let config = self.store.update_config(|config| {
            config.set(key, value)?;
            Ok(config.clone())
        })?;
        tracing::info!(key, value, "updated config");
        Ok(config)
    }
}
