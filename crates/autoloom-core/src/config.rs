//! Autoloom configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AutoloomError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AutoloomConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AutoloomConfig {
    /// Load config from the default path (~/.autoloom/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AutoloomError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| AutoloomError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AutoloomError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_workers == 0 {
            return Err(AutoloomError::config("scheduler.max_workers must be at least 1"));
        }
        if self.scheduler.tick_interval_ms == 0 || self.supervisor.check_interval_ms == 0 {
            return Err(AutoloomError::config("polling intervals must be positive"));
        }
        if self.scheduler.retry_base_delay_secs > self.scheduler.retry_max_delay_secs {
            return Err(AutoloomError::config(
                "scheduler.retry_base_delay_secs exceeds retry_max_delay_secs",
            ));
        }
        if self.intent.default_hour > 23 {
            return Err(AutoloomError::config("intent.default_hour must be 0-23"));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Autoloom home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".autoloom")
    }
}

/// Execution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_delay_secs: u64,
    /// Records kept in memory per job; SQLite keeps everything.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_tick_interval_ms() -> u64 { 1000 }
fn default_max_workers() -> usize { 4 }
fn default_timeout_secs() -> u64 { 3600 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base() -> u64 { 5 }
fn default_retry_max() -> u64 { 300 }
fn default_history_limit() -> usize { 100 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_workers: default_max_workers(),
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: default_max_retries(),
            retry_base_delay_secs: default_retry_base(),
            retry_max_delay_secs: default_retry_max(),
            history_limit: default_history_limit(),
        }
    }
}

/// Process supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// SIGTERM to SIGKILL window on stop.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// HTTP health probes are skipped this long after a start.
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,
    #[serde(default = "default_restart_base")]
    pub restart_base_delay_secs: u64,
    #[serde(default = "default_restart_max")]
    pub restart_max_delay_secs: u64,
    /// Running this long without a crash resets the restart counter.
    #[serde(default = "default_reset_after")]
    pub reset_after_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub default_max_restarts: u32,
}

fn default_check_interval_ms() -> u64 { 5000 }
fn default_health_timeout() -> u64 { 10 }
fn default_grace_period() -> u64 { 10 }
fn default_startup_grace() -> u64 { 5 }
fn default_restart_base() -> u64 { 5 }
fn default_restart_max() -> u64 { 300 }
fn default_reset_after() -> u64 { 600 }
fn default_max_restarts() -> u32 { 3 }

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            health_timeout_secs: default_health_timeout(),
            grace_period_secs: default_grace_period(),
            startup_grace_secs: default_startup_grace(),
            restart_base_delay_secs: default_restart_base(),
            restart_max_delay_secs: default_restart_max(),
            reset_after_secs: default_reset_after(),
            default_max_restarts: default_max_restarts(),
        }
    }
}

/// Intent parser settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Upper bound on one language-model round trip.
    #[serde(default = "default_model_timeout")]
    pub model_timeout_secs: u64,
    /// Hour used for "daily"/"weekly" phrases without an explicit time.
    #[serde(default = "default_hour")]
    pub default_hour: u32,
    /// OpenAI-compatible base URL. Empty = pattern rules only.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Falls back to `AUTOLOOM_API_KEY` when empty.
    #[serde(default)]
    pub api_key: String,
}

fn default_model_timeout() -> u64 { 20 }
fn default_hour() -> u32 { 9 }
fn default_model() -> String { "gpt-4o-mini".into() }

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            model_timeout_secs: default_model_timeout(),
            default_hour: default_hour(),
            endpoint: String::new(),
            model: default_model(),
            api_key: String::new(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn bool_true() -> bool { true }
fn default_db_path() -> String { "~/.autoloom/autoloom.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AutoloomConfig::default();
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.scheduler.retry_base_delay_secs, 5);
        assert_eq!(config.supervisor.default_max_restarts, 3);
        assert_eq!(config.intent.default_hour, 9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [scheduler]
            max_workers = 8
            retry_base_delay_secs = 2

            [supervisor]
            reset_after_secs = 120

            [storage]
            enabled = false
        "#;

        let config: AutoloomConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.max_workers, 8);
        assert_eq!(config.scheduler.retry_base_delay_secs, 2);
        assert_eq!(config.scheduler.retry_max_delay_secs, 300);
        assert_eq!(config.supervisor.reset_after_secs, 120);
        assert!(!config.storage.enabled);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: AutoloomConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.max_workers, 4);
        assert_eq!(config.storage.db_path, "~/.autoloom/autoloom.db");
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = AutoloomConfig::default();
        config.scheduler.max_workers = 0;
        assert!(matches!(config.validate(), Err(AutoloomError::Config(_))));
    }

    #[test]
    fn test_home_dir() {
        let home = AutoloomConfig::home_dir();
        assert!(home.to_string_lossy().contains("autoloom"));
    }
}
