use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{QueueError, Result};

pub const KEYS: &[&str] = &[
    "max_retries",
    "backoff_base",
    "poll_interval_ms",
    "job_timeout_ms",
];

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: f64 = 2.0;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_JOB_TIMEOUT_MS: u64 = 15_000;

/// A stored configuration value. `config set` keeps anything that is not a
/// finite number as the literal text; typed readers fall back to the key's
/// default for such values.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(untagged)]
pub enum Setting {
    Number(f64),
    Text(String),
}

impl Setting {
    fn parse(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Setting::Number(n),
            _ => Setting::Text(raw.to_string()),
        }
    }

    fn as_whole(&self) -> Option<u64> {
        match self {
            Setting::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n <= u64::MAX as f64 => {
                Some(*n as u64)
            }
            _ => None,
        }
    }
}

impl serde::Serialize for Setting {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Setting::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                serializer.serialize_i64(*n as i64)
            }
            Setting::Number(n) => serializer.serialize_f64(*n),
            Setting::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Number(n) => write!(f, "{n}"),
            Setting::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Store-wide tunables, persisted as TOML next to the job store.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: Setting,
    pub backoff_base: Setting,
    pub poll_interval_ms: Setting,
    pub job_timeout_ms: Setting,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: Setting::Number(DEFAULT_MAX_RETRIES as f64),
            backoff_base: Setting::Number(DEFAULT_BACKOFF_BASE),
            poll_interval_ms: Setting::Number(DEFAULT_POLL_INTERVAL_MS as f64),
            job_timeout_ms: Setting::Number(DEFAULT_JOB_TIMEOUT_MS as f64),
        }
    }
}

impl QueueConfig {
    pub fn max_retries(&self) -> u32 {
        self.max_retries
            .as_whole()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or_else(|| fallback("max_retries", &self.max_retries, DEFAULT_MAX_RETRIES))
    }

    pub fn backoff_base(&self) -> f64 {
        match self.backoff_base {
            Setting::Number(n) if n > 0.0 => n,
            _ => fallback("backoff_base", &self.backoff_base, DEFAULT_BACKOFF_BASE),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        let ms = self.poll_interval_ms.as_whole().unwrap_or_else(|| {
            fallback(
                "poll_interval_ms",
                &self.poll_interval_ms,
                DEFAULT_POLL_INTERVAL_MS,
            )
        });
        Duration::from_millis(ms)
    }

    pub fn job_timeout(&self) -> Duration {
        let ms = self
            .job_timeout_ms
            .as_whole()
            .filter(|ms| *ms > 0)
            .unwrap_or_else(|| {
                fallback("job_timeout_ms", &self.job_timeout_ms, DEFAULT_JOB_TIMEOUT_MS)
            });
        Duration::from_millis(ms)
    }

    pub fn get(&self, key: &str) -> Result<&Setting> {
        match key {
            "max_retries" => Ok(&self.max_retries),
            "backoff_base" => Ok(&self.backoff_base),
            "poll_interval_ms" => Ok(&self.poll_interval_ms),
            "job_timeout_ms" => Ok(&self.job_timeout_ms),
            _ => Err(QueueError::UnknownConfigKey {
                key: key.to_string(),
            }),
        }
    }

    /// Update one key from its command-line text.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<&Setting> {
        let slot = match key {
            "max_retries" => &mut self.max_retries,
            "backoff_base" => &mut self.backoff_base,
            "poll_interval_ms" => &mut self.poll_interval_ms,
            "job_timeout_ms" => &mut self.job_timeout_ms,
            _ => {
                return Err(QueueError::UnknownConfigKey {
                    key: key.to_string(),
                });
            }
        };
        *slot = Setting::parse(raw);
        Ok(slot)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &Setting)> {
        KEYS.iter()
            .filter_map(|key| self.get(key).ok().map(|value| (*key, value)))
    }
}

fn fallback<T: fmt::Display>(key: &str, value: &Setting, default: T) -> T {
    tracing::warn!(key, value = %value, default = %default, "invalid config value; using default");
    default
}

pub fn load(path: &Path) -> Result<QueueConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).map_err(|e| QueueError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QueueConfig::default()),
        Err(e) => Err(e.into()),
    }
}

pub fn save(path: &Path, config: &QueueConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)?;
    crate::store::write_atomic(path, contents.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.backoff_base(), 2.0);
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.job_timeout(), Duration::from_millis(15_000));
    }

    #[test]
    fn test_set_numeric_value() {
        let mut config = QueueConfig::default();
        config.set("max_retries", "5").unwrap();
        config.set("backoff_base", "1.5").unwrap();
        assert_eq!(config.max_retries(), 5);
        assert_eq!(config.backoff_base(), 1.5);
    }

    #[test]
    fn test_set_unknown_key_is_rejected() {
        let mut config = QueueConfig::default();
        let err = config.set("retries", "5").unwrap_err();
        assert!(matches!(err, QueueError::UnknownConfigKey { key } if key == "retries"));
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn test_non_numeric_value_is_stored_literally() {
        let mut config = QueueConfig::default();
        config.set("backoff_base", "abc").unwrap();
        assert_eq!(config.backoff_base, Setting::Text("abc".to_string()));
        assert_eq!(config.backoff_base(), 2.0);
    }

    #[test]
    fn test_out_of_range_values_fall_back() {
        let mut config = QueueConfig::default();
        config.set("max_retries", "-1").unwrap();
        config.set("poll_interval_ms", "2.5").unwrap();
        config.set("job_timeout_ms", "0").unwrap();
        config.set("backoff_base", "inf").unwrap();
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.job_timeout(), Duration::from_millis(15_000));
        assert_eq!(config.backoff_base, Setting::Text("inf".to_string()));
    }

    #[test]
    fn test_save_and_load_preserve_literals() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let mut config = QueueConfig::default();
        config.set("backoff_base", "abc").unwrap();
        config.set("poll_interval_ms", "250").unwrap();
        save(&path, &config).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("poll_interval_ms = 250"));
        assert!(contents.contains(r#"backoff_base = "abc""#));

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_and_keys_use_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        assert_eq!(load(&path).unwrap(), QueueConfig::default());

        std::fs::write(&path, "max_retries = 7\n").unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.max_retries(), 7);
        assert_eq!(config.job_timeout(), Duration::from_millis(15_000));
    }

    #[test]
    fn test_unparseable_file_is_corrupt() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "max_retries = [").unwrap();
        assert!(matches!(load(&path), Err(QueueError::Corrupt { .. })));
    }
}
