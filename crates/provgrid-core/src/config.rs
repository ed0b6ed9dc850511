//! provgrid.toml configuration parser.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below. Durations are written as strings such as `"30s"`,
//! `"500ms"` or `"2m"`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvgridConfig {
    pub store: StoreConfig,
    pub template: TemplateConfig,
    pub scheduler: SchedulerConfig,
    pub workers: WorkersConfig,
    pub lease: LeaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/provgrid/provgrid.redb"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Application order of mandatory partial templates. Mandatory partials
    /// not listed here are applied afterwards in name order.
    pub mandatory_order: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retries allowed per task after its first attempt.
    pub max_retries: u32,
    pub retry_base_delay: String,
    pub retry_max_delay: String,
    /// A task that does not report within this window is retried.
    pub task_timeout: String,
    /// Fallback wakeup for the dispatch and balance loops.
    pub dispatch_interval: String,
    /// How often in-flight tasks are checked against `task_timeout`.
    pub timeout_sweep_interval: String,
    /// Bound of the callback hand-off queue.
    pub callback_queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: "1s".to_string(),
            retry_max_delay: "1m".to_string(),
            task_timeout: "30m".to_string(),
            dispatch_interval: "1s".to_string(),
            timeout_sweep_interval: "10s".to_string(),
            callback_queue_depth: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// A worker silent for longer than this is considered lost.
    pub heartbeat_timeout: String,
    pub reap_interval: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: "30s".to_string(),
            reap_interval: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub sweep_interval: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            sweep_interval: "1m".to_string(),
        }
    }
}

/// Errors raised while loading or validating a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },
}

impl ProvgridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ProvgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that every duration field parses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.retry_base_delay()?;
        self.scheduler.retry_max_delay()?;
        self.scheduler.task_timeout()?;
        self.scheduler.dispatch_interval()?;
        self.scheduler.timeout_sweep_interval()?;
        self.workers.heartbeat_timeout()?;
        self.workers.reap_interval()?;
        self.lease.sweep_interval()?;
        Ok(())
    }
}

fn field_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

impl SchedulerConfig {
    pub fn retry_base_delay(&self) -> Result<Duration, ConfigError> {
        field_duration("scheduler.retry_base_delay", &self.retry_base_delay)
    }

    pub fn retry_max_delay(&self) -> Result<Duration, ConfigError> {
        field_duration("scheduler.retry_max_delay", &self.retry_max_delay)
    }

    pub fn task_timeout(&self) -> Result<Duration, ConfigError> {
        field_duration("scheduler.task_timeout", &self.task_timeout)
    }

    pub fn dispatch_interval(&self) -> Result<Duration, ConfigError> {
        field_duration("scheduler.dispatch_interval", &self.dispatch_interval)
    }

    pub fn timeout_sweep_interval(&self) -> Result<Duration, ConfigError> {
        field_duration(
            "scheduler.timeout_sweep_interval",
            &self.timeout_sweep_interval,
        )
    }
}

impl WorkersConfig {
    pub fn heartbeat_timeout(&self) -> Result<Duration, ConfigError> {
        field_duration("workers.heartbeat_timeout", &self.heartbeat_timeout)
    }

    pub fn reap_interval(&self) -> Result<Duration, ConfigError> {
        field_duration("workers.reap_interval", &self.reap_interval)
    }
}

impl LeaseConfig {
    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        field_duration("lease.sweep_interval", &self.sweep_interval)
    }
}

/// Parse a duration string like "5s", "500ms", "2m" or "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = ProvgridConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(
            config.scheduler.task_timeout().unwrap(),
            Duration::from_secs(1800)
        );
        assert!(config.template.mandatory_order.is_empty());
    }

    #[test]
    fn parse_sections() {
        let toml_str = r#"
[store]
path = "/tmp/pg.redb"

[template]
mandatory_order = ["security", "monitoring"]

[scheduler]
max_retries = 5
task_timeout = "90s"

[workers]
heartbeat_timeout = "10s"
"#;
        let config = ProvgridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/tmp/pg.redb"));
        assert_eq!(
            config.template.mandatory_order,
            vec!["security".to_string(), "monitoring".to_string()]
        );
        assert_eq!(config.scheduler.max_retries, 5);
        assert_eq!(
            config.scheduler.task_timeout().unwrap(),
            Duration::from_secs(90)
        );
        assert_eq!(
            config.workers.heartbeat_timeout().unwrap(),
            Duration::from_secs(10)
        );
        // Untouched fields keep their defaults.
        assert_eq!(config.scheduler.callback_queue_depth, 256);
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let err = ProvgridConfig::from_toml_str("[scheduler]\ntask_timeout = \"soon\"\n")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Duration {
                field: "scheduler.task_timeout",
                ..
            }
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ProvgridConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("max_retries"));
        let back = ProvgridConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.scheduler.max_retries, config.scheduler.max_retries);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("ten"), None);
    }
}
