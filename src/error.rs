use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("could not acquire lock {} after {attempts} attempts; try again later", path.display())]
    LockAcquisition { path: PathBuf, attempts: u32 },

    #[error("job not found: {id}")]
    JobNotFound { id: String },

    #[error("unknown config key: {key}")]
    UnknownConfigKey { key: String },

    #[error("corrupt file {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialize(err.to_string())
    }
}

impl From<toml::ser::Error> for QueueError {
    fn from(err: toml::ser::Error) -> Self {
        QueueError::Serialize(err.to_string())
    }
}

impl QueueError {
    /// Faults that leave the store unusable. A worker exits on these and
    /// relies on its supervisor; everything else aborts one operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::Corrupt { .. } | QueueError::Serialize(_) | QueueError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
