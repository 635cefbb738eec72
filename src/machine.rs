//! Job state transitions over a loaded [`Snapshot`]. Nothing here touches
//! the filesystem; callers hold the queue lock across load, transition and
//! save.

use chrono::{DateTime, Duration, Utc};

use crate::error::{QueueError, Result};
use crate::id::JobId;
use crate::job::{DlqEntry, Job, JobState, MAX_TEXT_CHARS, Snapshot, truncate_chars};

const MAX_BACKOFF: Duration = Duration::days(365);

/// Delay before attempt `attempts + 1`: `base^attempts` seconds.
pub fn backoff_delay(base: f64, attempts: u32) -> Duration {
    let secs = base.powi(attempts.min(i32::MAX as u32) as i32);
    if !secs.is_finite() || secs * 1000.0 >= MAX_BACKOFF.num_milliseconds() as f64 {
        return MAX_BACKOFF;
    }
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Counts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub dead: usize,
}

impl Counts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }
}

/// A Processing job whose owner let its lease run out.
#[derive(Debug, PartialEq)]
pub struct Reclaimed {
    pub id: JobId,
    pub worker: String,
    pub state: JobState,
}

impl Snapshot {
    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn enqueue(&mut self, command: String, max_retries: u32, now: DateTime<Utc>) -> Job {
        let job = Job::new(command, max_retries, now);
        self.jobs.push(job.clone());
        job
    }

    /// Claim the oldest due Pending job for `worker_id`. Jobs are scanned in
    /// insertion order, which gives rough FIFO fairness.
    pub fn reserve(
        &mut self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        let job = self.jobs.iter_mut().find(|j| j.is_due(now))?;

        job.state = JobState::Processing;
        job.next_run_at = None;
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.lease_expires_at = Some(
            now.checked_add_signed(lease)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        job.updated_at = now;

        Some(job.clone())
    }

    /// Fail every Processing job whose lease expired before `now`. Each one
    /// counts as an attempt, so a command that keeps killing its worker still
    /// ends up in the DLQ.
    pub fn reclaim_expired(&mut self, backoff_base: f64, now: DateTime<Utc>) -> Vec<Reclaimed> {
        let expired: Vec<(JobId, String)> = self
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Processing)
            .filter(|j| j.lease_expires_at.is_some_and(|at| at <= now))
            .map(|j| (j.id.clone(), j.locked_by.clone().unwrap_or_default()))
            .collect();

        expired
            .into_iter()
            .filter_map(|(id, worker)| {
                let error = format!("lease expired while held by {worker}");
                let state = self.fail_or_retry(&id, &worker, &error, backoff_base, now)?;
                Some(Reclaimed { id, worker, state })
            })
            .collect()
    }

    /// Processing -> Completed. Returns false, changing nothing, when the job
    /// is gone or is no longer held by `worker_id`.
    pub fn complete(
        &mut self,
        id: &JobId,
        worker_id: &str,
        output: &str,
        elapsed_sec: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(job) = self.jobs.iter_mut().find(|j| &j.id == id) else {
            return false;
        };
        if !held_by(job, worker_id) {
            return false;
        }

        job.state = JobState::Completed;
        job.output = Some(truncate_chars(output, MAX_TEXT_CHARS));
        job.elapsed_sec = Some(elapsed_sec);
        job.clear_lock();
        job.updated_at = now;
        true
    }

    /// Record a failed attempt. The job goes back to Pending with exponential
    /// backoff while `attempts <= max_retries`, otherwise to Dead with one DLQ
    /// entry. Returns the resulting state, or `None` when the job is gone or
    /// held by someone else.
    pub fn fail_or_retry(
        &mut self,
        id: &JobId,
        worker_id: &str,
        error: &str,
        backoff_base: f64,
        now: DateTime<Utc>,
    ) -> Option<JobState> {
        let Snapshot { jobs, dlq } = self;
        let job = jobs.iter_mut().find(|j| &j.id == id)?;

        if job.state == JobState::Dead {
            return Some(JobState::Dead);
        }
        if !held_by(job, worker_id) {
            return None;
        }

        job.attempts += 1;
        job.last_error = Some(truncate_chars(error, MAX_TEXT_CHARS));
        job.clear_lock();
        job.updated_at = now;

        if job.attempts <= job.max_retries {
            job.state = JobState::Pending;
            job.next_run_at = Some(now + backoff_delay(backoff_base, job.attempts));
        } else {
            job.state = JobState::Dead;
            job.next_run_at = None;
            if !dlq.iter().any(|d| &d.id == id) {
                dlq.push(DlqEntry {
                    id: job.id.clone(),
                    moved_at: now,
                    last_error: job.last_error.clone(),
                    command: job.command.clone(),
                });
            }
        }

        Some(job.state)
    }

    /// Dead -> Pending with a fresh retry budget, dropping the DLQ entry.
    pub fn requeue_from_dead(&mut self, id: &JobId, now: DateTime<Utc>) -> Result<Job> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| &j.id == id && j.state == JobState::Dead)
            .ok_or_else(|| QueueError::JobNotFound { id: id.to_string() })?;

        job.state = JobState::Pending;
        job.attempts = 0;
        job.next_run_at = Some(now);
        job.clear_lock();
        job.updated_at = now;
        let job = job.clone();

        self.dlq.retain(|d| &d.id != id);
        Ok(job)
    }

    pub fn list_by_state(&self, state: JobState) -> Vec<&Job> {
        self.jobs.iter().filter(|j| j.state == state).collect()
    }

    pub fn summary_counts(&self) -> Counts {
        let mut counts = Counts::default();
        for job in &self.jobs {
            match job.state {
                JobState::Pending => counts.pending += 1,
                JobState::Processing => counts.processing += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Dead => counts.dead += 1,
            }
        }
        counts
    }
}

fn held_by(job: &Job, worker_id: &str) -> bool {
    job.state == JobState::Processing && job.locked_by.as_deref() == Some(worker_id)
}
