use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::id::JobId;

/// Longest `last_error` / `output` kept on a job, in characters.
pub const MAX_TEXT_CHARS: usize = 4000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown job state: {s}"))
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub elapsed_sec: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(command: String, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            next_run_at: Some(now),
            locked_by: None,
            locked_at: None,
            lease_expires_at: None,
            last_error: None,
            output: None,
            elapsed_sec: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_run_at.is_none_or(|at| at <= now)
    }

    pub(crate) fn clear_lock(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
        self.lease_expires_at = None;
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DlqEntry {
    pub id: JobId,
    pub moved_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub command: String,
}

/// The whole persisted store: every job in insertion order plus the DLQ.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Snapshot {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub dlq: Vec<DlqEntry>,
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
