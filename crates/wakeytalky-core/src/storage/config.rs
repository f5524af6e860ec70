//! TOML-based application configuration.
//!
//! Stores:
//! - Defaults applied to newly created alarms
//! - Storage tuning (file name, history cap, retry and timeout)
//! - Collaborator call timeouts
//! - Log level
//!
//! Configuration is stored at `~/.config/wakeytalky/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::data_dir;
use crate::alarm::SnoozePolicy;
use crate::error::ConfigError;

/// Snooze/challenge settings for new alarms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmDefaults {
    #[serde(default = "default_true")]
    pub snooze_enabled: bool,
    #[serde(default = "default_snooze_interval")]
    pub snooze_interval_minutes: u32,
    #[serde(default = "default_max_snooze")]
    pub max_snooze_count: u32,
    #[serde(default = "default_task_threshold")]
    pub task_required_after_snoozes: u32,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_file_name")]
    pub file_name: String,
    /// Resolved alarm instances kept for history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_save_retries")]
    pub save_retries: u32,
    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub io_timeout_ms: u64,
}

/// Collaborator (notification platform, voice) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive, overridden by RUST_LOG.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/wakeytalky/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub alarm_defaults: AlarmDefaults,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub log: LogConfig,
}

// Default functions
fn default_true() -> bool {
    true
}
fn default_snooze_interval() -> u32 {
    5
}
fn default_max_snooze() -> u32 {
    3
}
fn default_task_threshold() -> u32 {
    2
}
fn default_file_name() -> String {
    "alarms.json".into()
}
fn default_history_limit() -> usize {
    200
}
fn default_save_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_timeout_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for AlarmDefaults {
    fn default() -> Self {
        Self {
            snooze_enabled: true,
            snooze_interval_minutes: default_snooze_interval(),
            max_snooze_count: default_max_snooze(),
            task_required_after_snoozes: default_task_threshold(),
        }
    }
}

impl AlarmDefaults {
    pub fn policy(&self) -> SnoozePolicy {
        SnoozePolicy {
            snooze_enabled: self.snooze_enabled,
            snooze_interval_minutes: self.snooze_interval_minutes,
            max_snooze_count: self.max_snooze_count,
            task_required_after_snoozes: self.task_required_after_snoozes,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_name: default_file_name(),
            history_limit: default_history_limit(),
            save_retries: default_save_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            io_timeout_ms: default_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_timeout_ms(),
        }
    }
}

impl PlatformConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let (parent_path, leaf) = match key.rsplit_once('.') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, key),
        };
        if leaf.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        if let Some(parent) = parent_path {
            for part in parent.split('.') {
                current = current.get_mut(part).ok_or_else(unknown)?;
            }
        }

        let obj = current.as_object_mut().ok_or_else(unknown)?;
        let existing = obj.get(leaf).ok_or_else(unknown)?;
        let new_value = match existing {
            serde_json::Value::Bool(_) => serde_json::Value::Bool(
                value
                    .parse::<bool>()
                    .map_err(|_| invalid(format!("cannot parse '{value}' as bool")))?,
            ),
            serde_json::Value::Number(_) => value
                .parse::<u64>()
                .map(|n| serde_json::Value::Number(n.into()))
                .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?,
            serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
            }
            _ => serde_json::Value::String(value.into()),
        };
        obj.insert(leaf.to_string(), new_value);
        Ok(())
    }

    fn path() -> Result<PathBuf, ConfigError> {
        data_dir()
            .map(|dir| dir.join("config.toml"))
            .map_err(|e| ConfigError::LoadFailed {
                path: PathBuf::from("~/.config/wakeytalky"),
                message: e.to_string(),
            })
    }

    /// Load from the default location, writing defaults if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a value in memory by dot-separated key. Call `save` to persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value cannot be parsed.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json =
            serde_json::to_value(&*self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        *self = serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Load from disk, returning default on error.
    /// This is a convenience method that never fails.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.alarm_defaults.max_snooze_count, 3);
        assert_eq!(parsed.storage.file_name, "alarms.json");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: Config = toml::from_str("[storage]\nsave_retries = 7\n").unwrap();
        assert_eq!(parsed.storage.save_retries, 7);
        assert_eq!(parsed.storage.history_limit, 200);
        assert_eq!(parsed.alarm_defaults.snooze_interval_minutes, 5);
        assert_eq!(parsed.log.level, "info");
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = Config::default();
        assert_eq!(cfg.get("alarm_defaults.snooze_enabled").as_deref(), Some("true"));
        assert_eq!(cfg.get("storage.io_timeout_ms").as_deref(), Some("2000"));
        assert_eq!(cfg.get("log.level").as_deref(), Some("info"));
        assert!(cfg.get("storage.missing_key").is_none());
    }

    #[test]
    fn set_updates_nested_values() {
        let mut cfg = Config::default();
        cfg.set("alarm_defaults.max_snooze_count", "5").unwrap();
        cfg.set("alarm_defaults.snooze_enabled", "false").unwrap();
        cfg.set("log.level", "debug").unwrap();
        assert_eq!(cfg.alarm_defaults.max_snooze_count, 5);
        assert!(!cfg.alarm_defaults.snooze_enabled);
        assert_eq!(cfg.log.level, "debug");
    }

    #[test]
    fn set_rejects_unknown_key() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.set("storage.nonexistent_key", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(cfg.set("nope", "1"), Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn set_rejects_invalid_type() {
        let mut cfg = Config::default();
        let result = cfg.set("alarm_defaults.snooze_enabled", "not_a_bool");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        assert!(cfg.alarm_defaults.snooze_enabled);
    }

    #[test]
    fn backoff_doubles() {
        let storage = StorageConfig::default();
        assert_eq!(storage.backoff(0), Duration::from_millis(100));
        assert_eq!(storage.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn load_from_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.storage.save_retries, 3);

        let mut changed = cfg.clone();
        changed.set("storage.history_limit", "10").unwrap();
        changed.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap().storage.history_limit, 10);
    }

    #[test]
    fn load_from_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::ParseFailed(_))));
    }
}
