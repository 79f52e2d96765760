//! Runner configuration loaded from `waves.toml`.
//!
//! [`WavesConfig`] holds the data root, queue timing and retry policy, the
//! notification sinks, job retention and the named adaptor configurations. Missing values
//! fall back to defaults. `WAVES_DATA_ROOT`, `WAVES_JOBS_MAX_RETRY`,
//! `WAVES_QUEUE_SLEEP_SECS`, `WAVES_KEEP_ANONYMOUS_JOBS` and
//! `WAVES_KEEP_REGISTERED_JOBS` take precedence over the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::adaptors::AdaptorConfig;
use crate::error::WavesError;
use crate::state_machine::{Job, RetryConfig};

/// Configuration file looked up in the current directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "waves.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct WavesConfig {
    /// Root directory holding job records and working dirs.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub purge: PurgeConfig,

    /// Adaptor configurations by name; jobs refer to them by that name.
    #[serde(default)]
    pub adaptors: BTreeMap<String, AdaptorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Pause between two queue passes.
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,

    /// Retries before a job is forced into ERROR.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// User notifications; admin error notifications are always logged.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Receives a JSON payload for every notification when set.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Retention of finished jobs. Jobs with a notification address count as
/// registered. Zero days keeps a class of jobs forever.
#[derive(Debug, Clone, Deserialize)]
pub struct PurgeConfig {
    #[serde(default = "default_keep_anonymous_days")]
    pub keep_anonymous_days: u32,

    #[serde(default = "default_keep_registered_days")]
    pub keep_registered_days: u32,

    /// Hours between two purge passes of the queue runner.
    #[serde(default = "default_purge_interval_hours")]
    pub interval_hours: u64,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("waves-data")
}

fn default_sleep_secs() -> u64 {
    5
}

fn default_max_retry() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_keep_anonymous_days() -> u32 {
    30
}

fn default_keep_registered_days() -> u32 {
    120
}

fn default_purge_interval_hours() -> u64 {
    24
}

fn default_true() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sleep_secs: default_sleep_secs(),
            max_retry: default_max_retry(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl QueueConfig {
    pub fn sleep(&self) -> Duration {
        Duration::from_secs(self.sleep_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retry: self.max_retry,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
        }
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            keep_anonymous_days: default_keep_anonymous_days(),
            keep_registered_days: default_keep_registered_days(),
            interval_hours: default_purge_interval_hours(),
        }
    }
}

impl PurgeConfig {
    /// How long `job` is kept once finished; `None` keeps it forever.
    pub fn retention(&self, job: &Job) -> Option<chrono::Duration> {
        let days = if job.email_to.is_some() {
            self.keep_registered_days
        } else {
            self.keep_anonymous_days
        };
        (days > 0).then(|| chrono::Duration::days(i64::from(days)))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.saturating_mul(3600))
    }
}

impl Default for WavesConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            queue: QueueConfig::default(),
            notify: NotifyConfig::default(),
            purge: PurgeConfig::default(),
            adaptors: BTreeMap::new(),
        }
    }
}

impl WavesConfig {
    /// Loads `path`, or `waves.toml` in the current directory when `path` is `None`.
    ///
    /// An explicit path must exist; the default one falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, WavesError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, WavesError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WavesError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(toml::from_str::<WavesConfig>(&contents)?)
    }

    /// Environment values win over the file; unparsable numbers are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(root) = non_empty("WAVES_DATA_ROOT") {
            self.data_root = PathBuf::from(root);
        }
        if let Some(max) = non_empty("WAVES_JOBS_MAX_RETRY").and_then(|v| v.trim().parse().ok()) {
            self.queue.max_retry = max;
        }
        if let Some(secs) = non_empty("WAVES_QUEUE_SLEEP_SECS").and_then(|v| v.trim().parse().ok())
        {
            self.queue.sleep_secs = secs;
        }
        if let Some(days) = non_empty("WAVES_KEEP_ANONYMOUS_JOBS").and_then(|v| v.trim().parse().ok())
        {
            self.purge.keep_anonymous_days = days;
        }
        if let Some(days) =
            non_empty("WAVES_KEEP_REGISTERED_JOBS").and_then(|v| v.trim().parse().ok())
        {
            self.purge.keep_registered_days = days;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::adaptors::AdaptorKind;
    use crate::state_machine::new_slug;

    #[test]
    fn default_config_values() {
        let config = WavesConfig::default();
        assert_eq!(config.data_root, PathBuf::from("waves-data"));
        assert_eq!(config.queue.sleep_secs, 5);
        assert_eq!(config.queue.max_retry, 5);
        assert!(config.notify.enabled);
        assert!(config.notify.webhook_url.is_none());
        assert!(config.adaptors.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            data_root = "/var/lib/waves"

            [queue]
            max_retry = 2

            [adaptors.local]
            kind = "local"
            command = "/usr/bin/blastp"

            [adaptors.cluster]
            kind = "ssh-sge"
            command = "muscle"
            host = "cluster.example.org"
            user_id = "waves"
            port = 2222
            queue = "long.q"
        "#;
        let config: WavesConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_root, PathBuf::from("/var/lib/waves"));
        assert_eq!(config.queue.max_retry, 2);
        assert_eq!(config.queue.sleep_secs, 5);

        let local = &config.adaptors["local"];
        assert_eq!(local.kind, AdaptorKind::Local);
        assert_eq!(
            local.params.get("command").and_then(|v| v.as_str()),
            Some("/usr/bin/blastp")
        );

        let cluster = &config.adaptors["cluster"];
        assert_eq!(cluster.kind, AdaptorKind::SshSge);
        assert_eq!(cluster.params.get("port").and_then(|v| v.as_integer()), Some(2222));

        assert!(!config.adaptors.contains_key("galaxy"));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("WAVES_DATA_ROOT", "/srv/waves"),
            ("WAVES_JOBS_MAX_RETRY", "9"),
            ("WAVES_QUEUE_SLEEP_SECS", "not-a-number"),
            ("WAVES_KEEP_ANONYMOUS_JOBS", "7"),
        ]
        .into_iter()
        .collect();

        let mut config = WavesConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.data_root, PathBuf::from("/srv/waves"));
        assert_eq!(config.queue.max_retry, 9);
        assert_eq!(config.queue.sleep_secs, 5);
        assert_eq!(config.purge.keep_anonymous_days, 7);
        assert_eq!(config.purge.keep_registered_days, 120);
    }

    #[test]
    fn retention_depends_on_address() {
        let purge: PurgeConfig = toml::from_str("keep_registered_days = 0").unwrap();
        assert_eq!(purge.keep_anonymous_days, 30);
        assert_eq!(purge.interval(), Duration::from_secs(24 * 3600));

        let mut job = Job::new(new_slug(), "mock".into(), PathBuf::from("/w"));
        assert_eq!(purge.retention(&job), Some(chrono::Duration::days(30)));
        job.email_to = Some("user@example.org".into());
        assert_eq!(purge.retention(&job), None);
    }

    #[test]
    fn retry_config_from_queue() {
        let queue = QueueConfig {
            max_retry: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
            ..QueueConfig::default()
        };
        let retry = queue.retry_config();
        assert_eq!(retry.max_retry, 3);
        assert_eq!(retry.delay_for_attempt(5), 40);
        assert_eq!(queue.sleep(), Duration::from_secs(5));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(matches!(
            WavesConfig::load(Some(&missing)),
            Err(WavesError::Config(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("waves.toml");
        std::fs::write(&path, "[queue]\nsleep_secs = 1\n").unwrap();
        let config = WavesConfig::from_file(&path).unwrap();
        assert_eq!(config.queue.sleep_secs, 1);
    }
}
