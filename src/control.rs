use std::io::ErrorKind;
use std::path::PathBuf;

use crate::paths::Layout;

/// The stop marker shared by every worker. Workers poll it between jobs.
#[derive(Clone, Debug)]
pub struct StopSignal {
    path: PathBuf,
}

impl StopSignal {
    pub fn new(layout: &Layout) -> Self {
        Self {
            path: layout.stop_flag_path(),
        }
    }

    pub fn request(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, chrono::Utc::now().to_rfc3339())?;
        tracing::debug!(path = %self.path.display(), "wrote stop marker");
        Ok(())
    }

    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "cleared stop marker");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.path.exists()
    }
}
