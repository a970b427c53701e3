use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::domain::NotificationConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub monitors: MonitorsConfig,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Number of dispatcher workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Default maximum delivery attempts per order
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    /// Signals older than this are failed at claim time, never dispatched
    #[serde(default = "default_stale_signal_max_secs")]
    pub stale_signal_max_secs: i64,
    /// Worker idle poll interval when the queue is empty (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Base delay for exponential retry backoff (milliseconds)
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Cap for retry backoff (milliseconds)
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    /// Interval between watchdog reconciliation cycles (seconds)
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// Age threshold before a processing/sent order is considered stuck (seconds)
    #[serde(default = "default_stuck_grace_secs")]
    pub stuck_grace_secs: i64,
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> i32 {
    3
}

fn default_stale_signal_max_secs() -> i64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_cap_ms() -> u64 {
    60_000
}

fn default_watchdog_interval_secs() -> u64 {
    30
}

fn default_stuck_grace_secs() -> i64 {
    300
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            stale_signal_max_secs: default_stale_signal_max_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            stuck_grace_secs: default_stuck_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Interval between alert evaluation cycles (seconds)
    #[serde(default = "default_alert_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_alert_poll_secs() -> u64 {
    30
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_alert_poll_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorsConfig {
    /// Interval between scheduler ticks (seconds)
    #[serde(default = "default_monitor_tick_secs")]
    pub tick_interval_secs: u64,
    /// Maximum due monitors executed per tick
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: i64,
}

fn default_monitor_tick_secs() -> u64 {
    30
}

fn default_max_per_tick() -> i64 {
    10
}

impl Default for MonitorsConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_monitor_tick_secs(),
            max_per_tick: default_max_per_tick(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifySettings {
    /// HTTP timeout for notification delivery (seconds)
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
    /// Shared Telegram bot token (per-target overrides take priority)
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    /// Operations channel for terminal order failures
    #[serde(default)]
    pub ops: Option<NotificationConfig>,
}

fn default_notify_timeout_secs() -> u64 {
    6
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_notify_timeout_secs(),
            telegram_bot_token: None,
            ops: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files (stdout only when unset)
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("database.max_connections", 5)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADEPIPE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TRADEPIPE_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("TRADEPIPE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.dispatch.workers == 0 {
            errors.push("dispatch.workers must be at least 1".to_string());
        }

        if self.dispatch.max_attempts < 1 {
            errors.push("dispatch.max_attempts must be at least 1".to_string());
        }

        if self.dispatch.stale_signal_max_secs <= 0 {
            errors.push("dispatch.stale_signal_max_secs must be positive".to_string());
        }

        if self.dispatch.retry_base_ms == 0 {
            errors.push("dispatch.retry_base_ms must be positive".to_string());
        }

        if self.dispatch.retry_cap_ms < self.dispatch.retry_base_ms {
            errors.push("dispatch.retry_cap_ms must be >= retry_base_ms".to_string());
        }

        if self.dispatch.stuck_grace_secs <= 0 {
            errors.push("dispatch.stuck_grace_secs must be positive".to_string());
        }

        if let Some(ops) = &self.notify.ops {
            if let Err(e) = ops.validate() {
                errors.push(format!("notify.ops: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dispatch_config() {
        let config = DispatchConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.stale_signal_max_secs, 120);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = AppConfig {
            database: DatabaseConfig {
                url: "postgres://localhost/tradepipe".to_string(),
                max_connections: 5,
            },
            dispatch: DispatchConfig {
                workers: 0,
                ..Default::default()
            },
            alerts: AlertsConfig::default(),
            monitors: MonitorsConfig::default(),
            notify: NotifySettings::default(),
            logging: LoggingConfig::default(),
        };

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("workers")));
    }
}
