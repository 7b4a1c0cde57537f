use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tickbot_cache::{CacheNamespace, FailureBackoff, Tick};
use tickbot_fsm::FailurePolicy;
use tracing::info;

use crate::config::paths::ProjectPaths;

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Config file not found")]
    NotFound,
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("IO error reading config: {0}")]
    IoError(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickbotConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,

    /// Also write logs to the data directory
    #[serde(default)]
    pub file: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Consecutive provider failures before a namespace cools down (0 disables)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_ticks")]
    pub cooldown_ticks: Tick,

    /// Per-namespace refresh interval overrides, in ticks
    #[serde(default)]
    pub intervals: BTreeMap<String, Tick>,
}

fn default_failure_threshold() -> u32 {
    FailureBackoff::default().failure_threshold
}

fn default_cooldown_ticks() -> Tick {
    FailureBackoff::default().cooldown_ticks
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ticks: default_cooldown_ticks(),
            intervals: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn backoff(&self) -> FailureBackoff {
        FailureBackoff {
            failure_threshold: self.failure_threshold,
            cooldown_ticks: self.cooldown_ticks,
        }
    }

    /// Apply the configured backoff and any interval override to `namespace`
    pub fn apply(&self, namespace: CacheNamespace) -> CacheNamespace {
        let namespace = namespace.with_backoff(self.backoff());
        match self.intervals.get(namespace.name()) {
            Some(&interval) => namespace.with_interval(interval),
            None => namespace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadsConfig {
    /// How long a graceful stop waits before the worker is declared a zombie
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Silence after which a worker is reported unresponsive
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

fn default_stop_timeout_ms() -> u64 {
    2_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl ThreadsConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Applied to bots registered without an explicit failure policy
    #[serde(default)]
    pub on_step_failure: StepFailureMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepFailureMode {
    #[default]
    Pause,
    Restart,
}

impl From<StepFailureMode> for FailurePolicy {
    fn from(mode: StepFailureMode) -> Self {
        match mode {
            StepFailureMode::Pause => FailurePolicy::Pause,
            StepFailureMode::Restart => FailurePolicy::Restart,
        }
    }
}

impl TickbotConfig {
    /// `config.toml` in the user's config directory
    pub fn config_path() -> Option<PathBuf> {
        ProjectPaths::new("tickbot").map(|paths| paths.config_file())
    }

    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = Self::config_path().ok_or(ConfigLoadError::NotFound)?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound);
        }

        let content =
            fs::read_to_string(path).map_err(|e| ConfigLoadError::IoError(e.to_string()))?;
        let config =
            toml::from_str(&content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        info!(target: "runner", "Loaded config from {}", path.display());
        Ok(config)
    }

    /// Like [`TickbotConfig::load`], but a missing file yields the defaults
    pub fn load_or_default() -> Result<Self, ConfigLoadError> {
        match Self::load() {
            Err(ConfigLoadError::NotFound) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        info!(target: "runner", "Saved config to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: TickbotConfig = toml::from_str("").unwrap();
        assert_eq!(config, TickbotConfig::default());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.cache.backoff(), FailureBackoff::default());
        assert_eq!(config.threads.stop_timeout(), Duration::from_secs(2));
        assert_eq!(config.scheduler.on_step_failure, StepFailureMode::Pause);
    }

    #[test]
    fn test_partial_sections() {
        let config: TickbotConfig = toml::from_str(
            r#"
            [cache]
            failure_threshold = 2

            [cache.intervals]
            map = 10

            [scheduler]
            on_step_failure = "restart"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.failure_threshold, 2);
        assert_eq!(config.cache.cooldown_ticks, 60);
        assert_eq!(config.cache.intervals.get("map"), Some(&10));
        assert_eq!(
            FailurePolicy::from(config.scheduler.on_step_failure),
            FailurePolicy::Restart
        );
    }

    #[test]
    fn test_unknown_failure_mode_rejected() {
        let result: Result<TickbotConfig, _> = toml::from_str(
            r#"
            [scheduler]
            on_step_failure = "explode"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_apply_overrides_interval() {
        let mut config = CacheConfig::default();
        config.intervals.insert("map".to_string(), 7);

        let map = config.apply(CacheNamespace::from_fn("map", 1, || Ok(0u32)));
        let player = config.apply(CacheNamespace::from_fn("player", 1, || Ok(0u32)));
        assert_eq!(map.refresh_interval(), 7);
        assert_eq!(player.refresh_interval(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = TickbotConfig::default();
        config.logging.file = true;
        config.threads.stop_timeout_ms = 250;
        config.save_to(&path).unwrap();

        let loaded = TickbotConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            TickbotConfig::load_from(&missing),
            Err(ConfigLoadError::NotFound)
        ));

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "[cache\nfailure_threshold = ").unwrap();
        assert!(matches!(
            TickbotConfig::load_from(&broken),
            Err(ConfigLoadError::ParseError(_))
        ));
    }
}
