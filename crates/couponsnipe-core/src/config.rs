//! CouponSnipe configuration system.
//!
//! TOML settings file at `~/.couponsnipe/config.toml`. Every field has a
//! serde default so a partial (or empty) file still loads.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Root settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub clock: ClockSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            execution: ExecutionSettings::default(),
            clock: ClockSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from the default path (~/.couponsnipe/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load settings from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::SnipeError::Config(format!("Failed to read config: {e}")))?;
        let settings: Self = toml::from_str(&content)
            .map_err(|e| crate::error::SnipeError::Config(format!("Failed to parse config: {e}")))?;
        Ok(settings)
    }

    /// Save settings to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SnipeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the CouponSnipe home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".couponsnipe")
    }
}

/// Defaults applied to new tasks unless overridden per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Lead time subtracted from the target fire time to cover request
    /// travel latency.
    #[serde(default = "default_advance_ms")]
    pub advance_ms: u64,
    /// Hedged request paths per logical attempt. 1 disables hedging.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_ms() -> u64 { 15_000 }
fn default_max_attempts() -> u32 { 10 }
fn default_interval_ms() -> u64 { 50 }
fn default_max_interval_ms() -> u64 { 5_000 }
fn default_advance_ms() -> u64 { 500 }
fn default_concurrency() -> u32 { 1 }
fn default_user_agent() -> String {
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1".into()
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            advance_ms: default_advance_ms(),
            concurrency: default_concurrency(),
            user_agent: default_user_agent(),
        }
    }
}

/// Time synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSettings {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Periodic resync cadence for the daemon loop.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Reference source used when a task's site has no dedicated endpoint.
    #[serde(default = "default_sync_source")]
    pub default_source: String,
}

fn bool_true() -> bool { true }
fn default_sync_interval_secs() -> u64 { 30 }
fn default_sync_source() -> String { "default".into() }

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_secs: default_sync_interval_secs(),
            default_source: default_sync_source(),
        }
    }
}

/// Execution log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_entries() -> usize { 1000 }

impl Default for LogSettings {
    fn default() -> Self {
        Self { max_entries: default_max_entries() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.execution.max_attempts, 10);
        assert_eq!(settings.execution.advance_ms, 500);
        assert_eq!(settings.execution.interval_ms, 50);
        assert_eq!(settings.clock.sync_interval_secs, 30);
    }

    #[test]
    fn test_settings_from_toml() {
        let toml_str = r#"
            [execution]
            max_attempts = 3
            interval_ms = 200

            [clock]
            sync_interval_secs = 60
        "#;

        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.execution.max_attempts, 3);
        assert_eq!(settings.execution.interval_ms, 200);
        // Unspecified fields fall back to defaults
        assert_eq!(settings.execution.timeout_ms, 15_000);
        assert_eq!(settings.clock.sync_interval_secs, 60);
    }

    #[test]
    fn test_settings_missing_fields_use_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.execution.concurrency, 1);
        assert_eq!(settings.log.max_entries, 1000);
    }

    #[test]
    fn test_home_dir() {
        let home = Settings::home_dir();
        assert!(home.to_string_lossy().contains("couponsnipe"));
    }
}
