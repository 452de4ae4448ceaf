//! Configuration module for postfan.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::subscription::WatermarkPolicy;
use crate::{PostfanError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/postfan.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file. Empty disables file logging.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/postfan.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Subscription engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionsConfig {
    /// Whether the subscription engine is enabled at all.
    ///
    /// When false the engine must not be constructed: no registry access,
    /// no sweep timer.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Hours between full-registry sweeps. Fractional values are allowed.
    #[serde(default = "default_sweep_interval_hours")]
    pub sweep_interval_hours: f64,
    /// Seconds to wait between accounts within a sweep, to stay polite
    /// toward the content source's rate limits.
    #[serde(default = "default_inter_account_delay_secs")]
    pub inter_account_delay_secs: u64,
    /// Default number of subscriptions a group may hold.
    #[serde(default = "default_max_per_group")]
    pub max_per_group: u32,
    /// Watermark advancement policy for partially failed batches.
    #[serde(default)]
    pub watermark_policy: WatermarkPolicy,
    /// Per-group quota overrides, keyed by group ID.
    #[serde(default)]
    pub group_overrides: HashMap<String, u32>,
}

fn default_enabled() -> bool {
    true
}

fn default_sweep_interval_hours() -> f64 {
    1.0
}

fn default_inter_account_delay_secs() -> u64 {
    2
}

fn default_max_per_group() -> u32 {
    4
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sweep_interval_hours: default_sweep_interval_hours(),
            inter_account_delay_secs: default_inter_account_delay_secs(),
            max_per_group: default_max_per_group(),
            watermark_policy: WatermarkPolicy::default(),
            group_overrides: HashMap::new(),
        }
    }
}

impl SubscriptionsConfig {
    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sweep_interval_hours * 3600.0)
    }

    /// Inter-account delay as a `Duration`.
    pub fn inter_account_delay(&self) -> Duration {
        Duration::from_secs(self.inter_account_delay_secs)
    }

    /// Subscription quota for a group, honoring per-group overrides.
    pub fn max_for_group(&self, group_id: &str) -> u32 {
        self.group_overrides
            .get(group_id)
            .copied()
            .unwrap_or(self.max_per_group)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Subscription engine configuration.
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(PostfanError::Io)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| PostfanError::Config(format!("config parse error: {e}")))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.subscriptions.sweep_interval_hours <= 0.0 {
            return Err(PostfanError::Config(
                "sweep_interval_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.subscriptions.enabled);
        assert_eq!(config.subscriptions.sweep_interval_hours, 1.0);
        assert_eq!(config.subscriptions.inter_account_delay_secs, 2);
        assert_eq!(config.subscriptions.max_per_group, 4);
        assert_eq!(config.database.path, "data/postfan.db");
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.subscriptions.watermark_policy,
            WatermarkPolicy::BatchTail
        );
    }

    #[test]
    fn test_parse_subscriptions_section() {
        let config = Config::parse(
            r#"
            [subscriptions]
            enabled = false
            sweep_interval_hours = 0.5
            inter_account_delay_secs = 0
            watermark_policy = "stop-at-failure"

            [subscriptions.group_overrides]
            "team-premium" = 25
            "#,
        )
        .unwrap();
        assert!(!config.subscriptions.enabled);
        assert_eq!(config.subscriptions.sweep_interval_hours, 0.5);
        assert_eq!(
            config.subscriptions.watermark_policy,
            WatermarkPolicy::StopAtFailure
        );
        assert_eq!(config.subscriptions.max_for_group("team-premium"), 25);
        assert_eq!(config.subscriptions.max_for_group("team-other"), 4);
    }

    #[test]
    fn test_sweep_interval_fractional_hours() {
        let config = Config::parse("[subscriptions]\nsweep_interval_hours = 0.25\n").unwrap();
        assert_eq!(
            config.subscriptions.sweep_interval(),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn test_validate_rejects_non_positive_interval() {
        let config = Config::parse("[subscriptions]\nsweep_interval_hours = 0.0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(Config::parse("not valid [toml").is_err());
    }
}
