mod executor;
mod pool;

use std::time::Duration;

use tokio::sync::watch;

use crate::control::StopSignal;
use crate::error::QueueError;
use crate::job::{Job, JobState};
use crate::paths::Layout;
use crate::queue::Queue;

pub use executor::{Execution, Outcome, execute};
pub use pool::start_pool;

/// What one pass through the loop did.
#[derive(Debug, PartialEq)]
pub enum Tick {
    Stopped,
    Idle(Duration),
    Ran(Option<JobState>),
}

pub struct Worker {
    id: String,
    queue: Queue,
    stop: StopSignal,
    layout: Layout,
}

impl Worker {
    pub fn new(id: String, layout: &Layout) -> Self {
        Self {
            id,
            queue: Queue::open(layout),
            stop: StopSignal::new(layout),
            layout: layout.clone(),
        }
    }

    /// Poll until the stop marker appears or `shutdown` fires. A job that is
    /// already executing always runs to completion first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(worker = %self.id, "worker started");

        loop {
            if *shutdown.borrow() {
                tracing::info!(worker = %self.id, "worker stopping (signal received)");
                break;
            }

            match self.tick().await? {
                Tick::Stopped => {
                    tracing::info!(worker = %self.id, "worker stopping (stop marker found)");
                    break;
                }
                Tick::Idle(poll) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        Ok(()) = shutdown.changed() => {}
                    }
                }
                Tick::Ran(_) => {}
            }
        }

        tracing::info!(worker = %self.id, "worker exited");
        Ok(())
    }

    /// One iteration: check the stop marker, reserve, execute, transition.
    /// Only store faults that make the queue unusable are returned as errors.
    pub async fn tick(&self) -> Result<Tick, QueueError> {
        if self.stop.is_requested() {
            return Ok(Tick::Stopped);
        }

        let reservation = match self.queue.reserve(&self.id) {
            Ok(reservation) => reservation,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(worker = %self.id, error = %e, "could not reserve a job");
                return Ok(Tick::Idle(crate::config::QueueConfig::default().poll_interval()));
            }
        };

        let Some(job) = reservation.job else {
            return Ok(Tick::Idle(reservation.config.poll_interval()));
        };

        let timeout = reservation.config.job_timeout();
        tracing::info!(worker = %self.id, id = %job.id, command = %job.command, attempt = job.attempts + 1, "processing job");

        let log_path = self.layout.job_log_path(job.id.as_str());
        let execution = execute(&job.command, timeout, &log_path).await;

        self.transition(&job, execution).map(Tick::Ran)
    }

    fn transition(&self, job: &Job, execution: Execution) -> Result<Option<JobState>, QueueError> {
        let elapsed_sec = execution.elapsed_sec();

        let result = match &execution.outcome {
            Outcome::Succeeded { stdout } => self
                .queue
                .complete(&job.id, &self.id, stdout, elapsed_sec)
                .map(|done| done.then_some(JobState::Completed)),
            Outcome::Failed { error } => self.queue.fail_or_retry(&job.id, &self.id, error),
        };

        let state = match result {
            Ok(state) => state,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // The job stays Processing until its lease expires.
                tracing::error!(worker = %self.id, id = %job.id, error = %e, "failed to record job result");
                return Ok(None);
            }
        };

        match state {
            Some(JobState::Completed) => {
                tracing::info!(worker = %self.id, id = %job.id, elapsed_sec, "job completed");
            }
            Some(JobState::Pending) => {
                tracing::info!(worker = %self.id, id = %job.id, elapsed_sec, "job failed; will retry after backoff");
            }
            Some(state) => {
                tracing::warn!(worker = %self.id, id = %job.id, state = %state, "job moved to DLQ");
            }
            None => {
                tracing::warn!(worker = %self.id, id = %job.id, "job no longer held by this worker; result discarded");
            }
        }

        Ok(state)
    }
}

pub fn default_worker_id() -> String {
    format!("w-{}", crate::id::short_token())
}

/// Resolve to true on SIGINT or SIGTERM.
pub async fn shutdown_signal() -> anyhow::Result<watch::Receiver<bool>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => { tracing::debug!("received SIGINT"); }
            _ = sigterm.recv() => { tracing::debug!("received SIGTERM"); }
        }
        let _ = tx.send(true);
    });

    Ok(rx)
}
