use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::cache::FlushPolicy;
use crate::error::ConfigError;

/// Where the cache lives and how often things are written out.
///
/// ```toml
/// cache_dir = ".stratum"
/// flush_bytes = 16777216
/// flush_interval = 300.0
/// progress_interval = 0.1
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache_dir: Utf8PathBuf,
    /// Buffer size that triggers a flush, in bytes.
    pub flush_bytes: usize,
    /// Longest time between flushes of a running task.
    #[serde(with = "seconds")]
    pub flush_interval: Duration,
    /// Shortest time between two progress emissions to observers.
    #[serde(with = "seconds")]
    pub progress_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from(".stratum"),
            flush_bytes: 16 * 1024 * 1024,
            flush_interval: Duration::from_secs(300),
            progress_interval: Duration::from_millis(100),
        }
    }
}

impl Settings {
    pub fn new(cache_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_toml_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&input)
    }

    pub(crate) fn flush_policy(&self, policy: &RunPolicy) -> FlushPolicy {
        let interval = policy
            .flush_interval_seconds
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.flush_interval);

        FlushPolicy {
            max_bytes: self.flush_bytes,
            interval,
        }
    }
}

/// Whether end-of-run hooks fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    /// Run the tasks, then the hooks.
    #[default]
    Run,
    /// Run the tasks only.
    Skip,
    /// Run the hooks only, against an empty result.
    Only,
}

/// Per-invocation options, as handed over by a command line or config
/// front-end.
///
/// Names in `rerun` and `exclude` are family names, instance labels such as
/// `sim[power=2]`, or glob patterns over either.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunPolicy {
    /// Ignore cache freshness. With an empty `rerun` list this reruns every
    /// task, otherwise only the named ones.
    pub force: bool,
    pub rerun: Vec<String>,
    pub exclude: Vec<String>,
    /// Rerunning a task also reruns everything depending on it.
    pub cascade: bool,
    /// Number of workers, defaults to the available parallelism.
    pub pool_size: Option<usize>,
    /// Overrides [`Settings::flush_interval`] for this run.
    pub flush_interval_seconds: Option<f64>,
    pub hooks: HookMode,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            force: false,
            rerun: Vec::new(),
            exclude: Vec::new(),
            cascade: true,
            pool_size: None,
            flush_interval_seconds: None,
            hooks: HookMode::Run,
        }
    }
}

impl RunPolicy {
    /// Reruns the given tasks regardless of their cache.
    pub fn rerun<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            force: true,
            rerun: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Reruns every task.
    pub fn force_all() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn cascade(mut self, cascade: bool) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn hooks(mut self, mode: HookMode) -> Self {
        self.hooks = mode;
        self
    }

    pub(crate) fn workers(&self) -> usize {
        self.pool_size.filter(|&size| size > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        })
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, de::Error};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_settings_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            cache_dir = "out/cache"
            flush_interval = 1.5
            progress_interval = 0
            "#,
        )
        .unwrap();

        assert_eq!(settings.cache_dir, "out/cache");
        assert_eq!(settings.flush_interval, Duration::from_millis(1500));
        assert_eq!(settings.progress_interval, Duration::ZERO);
        assert_eq!(settings.flush_bytes, Settings::default().flush_bytes);
    }

    #[test]
    fn test_negative_interval_is_rejected() {
        assert!(Settings::from_toml_str("flush_interval = -1.0").is_err());
    }

    #[test]
    fn test_policy_option_names() {
        let policy: RunPolicy = toml::from_str(
            r#"
            force = true
            rerun = ["sim"]
            exclude = ["vis*"]
            cascade = false
            poolSize = 2
            flushIntervalSeconds = 0.5
            hooks = "skip"
            "#,
        )
        .unwrap();

        assert!(policy.force);
        assert_eq!(policy.rerun, ["sim"]);
        assert_eq!(policy.exclude, ["vis*"]);
        assert!(!policy.cascade);
        assert_eq!(policy.workers(), 2);
        assert_eq!(policy.hooks, HookMode::Skip);

        let flush = Settings::default().flush_policy(&policy);
        assert_eq!(flush.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_policy_defaults() {
        let policy: RunPolicy = toml::from_str("").unwrap();
        assert_eq!(policy, RunPolicy::default());
        assert!(policy.cascade);
        assert!(policy.workers() >= 1);
    }
}
