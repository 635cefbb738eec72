use std::path::{Path, PathBuf};

/// Every on-disk location used by the queue, resolved once per process.
#[derive(Clone, Debug)]
pub struct Layout {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl Layout {
    /// Resolve from the `--home` flag, falling through to `QUEUECTL_HOME`
    /// and then the XDG base directories.
    pub fn resolve(home: Option<PathBuf>) -> anyhow::Result<Self> {
        let home = home.or_else(|| {
            std::env::var("QUEUECTL_HOME")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        });

        if let Some(home) = home {
            return Ok(Self::under(&home));
        }

        Ok(Self {
            data_dir: xdg_dir("XDG_DATA_HOME", &[".local", "share"])?,
            config_dir: xdg_dir("XDG_CONFIG_HOME", &[".config"])?,
            runtime_dir: match std::env::var("XDG_RUNTIME_DIR") {
                Ok(val) if !val.is_empty() => PathBuf::from(val).join("queuectl"),
                _ => std::env::temp_dir().join("queuectl"),
            },
        })
    }

    /// A self-contained layout rooted at `home`.
    pub fn under(home: &Path) -> Self {
        Self {
            data_dir: home.join("data"),
            config_dir: home.join("config"),
            runtime_dir: home.join("runtime"),
        }
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir.join("queue.lock")
    }

    pub fn stop_flag_path(&self) -> PathBuf {
        self.runtime_dir.join("stop.flag")
    }

    pub fn job_log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn job_log_path(&self, job_id: &str) -> PathBuf {
        self.job_log_dir().join(format!("{job_id}.log"))
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [
            &self.data_dir,
            &self.config_dir,
            &self.runtime_dir,
            &self.job_log_dir(),
        ] {
            tracing::debug!(path = %dir.display(), "ensuring directory");
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn xdg_dir(var: &str, fallback: &[&str]) -> anyhow::Result<PathBuf> {
    let base = match std::env::var(var) {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => {
            let home = dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
            fallback.iter().fold(home, |acc, part| acc.join(part))
        }
    };

    Ok(base.join("queuectl"))
}
