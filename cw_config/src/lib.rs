//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles scheduler capacities, storage, notifications and database settings

use config::{Config as ConfigBuilder, Environment, File};
use cw_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    #[validate(nested)]
    pub storage: StorageConfig,
    #[validate(nested)]
    pub notify: NotifyConfig,
    pub telemetry: TelemetryConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub path: String,
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,
    pub sqlite_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "camwatch.db".to_string(),
            pool_size: 10,
            sqlite_wal: true,
        }
    }
}

/// How a manual job behaves when fewer detection slots are free than it has targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicySetting {
    /// Run on the cameras that fit
    #[default]
    Partial,
    /// Reject the job unless every target fits
    AllOrNothing,
}

/// Stream and detection scheduling limits
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct SchedulerConfig {
    #[validate(range(min = 1, max = 400))]
    pub stream_slots: usize,
    #[validate(range(min = 1, max = 400))]
    pub detection_slots: usize,
    #[validate(range(min = 1, max = 400))]
    pub batch_size: usize,
    #[validate(range(min = 1, max = 7200))]
    pub cycle_duration_secs: u64,
    #[validate(range(min = 1, max = 600))]
    pub poll_interval_secs: u64,
    #[validate(range(min = 1, max = 300))]
    pub detection_timeout_secs: u64,
    #[validate(range(min = 10, max = 10000))]
    pub frame_interval_ms: u64,
    #[validate(range(min = 10, max = 60000))]
    pub frame_timeout_ms: u64,
    #[validate(range(min = 1, max = 1000))]
    pub degrade_after_failures: u32,
    pub capacity_policy: CapacityPolicySetting,
    /// Seed the next automatic batch as soon as one completes
    pub auto_continue: bool,
    #[validate(range(min = 1, max = 600))]
    pub capacity_retry_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stream_slots: 20,
            detection_slots: 20,
            batch_size: 20,
            cycle_duration_secs: 300,
            poll_interval_secs: 2,
            detection_timeout_secs: 30,
            frame_interval_ms: 100,
            frame_timeout_ms: 5000,
            degrade_after_failures: 5,
            capacity_policy: CapacityPolicySetting::Partial,
            auto_continue: true,
            capacity_retry_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn cycle_duration(&self) -> Duration {
        Duration::from_secs(self.cycle_duration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_secs(self.detection_timeout_secs)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn capacity_retry(&self) -> Duration {
        Duration::from_secs(self.capacity_retry_secs)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory that receives annotated detection snapshots
    #[validate(length(min = 1))]
    pub artifacts_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: "./data/detections".to_string(),
        }
    }
}

/// Outbound notification configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct NotifyConfig {
    #[validate(custom(function = "validate_http_url"))]
    pub webhook_url: Option<String>,
}

fn validate_http_url(value: &str) -> std::result::Result<(), ValidationError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ValidationError::new("webhook_url_scheme"))
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
        }
    }
}

/// Keys whose names contain the `_` separator and therefore cannot be
/// resolved by the generic environment source.
const EXPLICIT_ENV_KEYS: &[(&str, &str)] = &[
    ("CAMWATCH_DATABASE_POOL_SIZE", "database.pool_size"),
    ("CAMWATCH_DATABASE_SQLITE_WAL", "database.sqlite_wal"),
    ("CAMWATCH_SCHEDULER_STREAM_SLOTS", "scheduler.stream_slots"),
    ("CAMWATCH_SCHEDULER_DETECTION_SLOTS", "scheduler.detection_slots"),
    ("CAMWATCH_SCHEDULER_BATCH_SIZE", "scheduler.batch_size"),
    ("CAMWATCH_SCHEDULER_CYCLE_DURATION_SECS", "scheduler.cycle_duration_secs"),
    ("CAMWATCH_SCHEDULER_POLL_INTERVAL_SECS", "scheduler.poll_interval_secs"),
    ("CAMWATCH_SCHEDULER_DETECTION_TIMEOUT_SECS", "scheduler.detection_timeout_secs"),
    ("CAMWATCH_SCHEDULER_FRAME_INTERVAL_MS", "scheduler.frame_interval_ms"),
    ("CAMWATCH_SCHEDULER_FRAME_TIMEOUT_MS", "scheduler.frame_timeout_ms"),
    ("CAMWATCH_SCHEDULER_DEGRADE_AFTER_FAILURES", "scheduler.degrade_after_failures"),
    ("CAMWATCH_SCHEDULER_CAPACITY_POLICY", "scheduler.capacity_policy"),
    ("CAMWATCH_SCHEDULER_AUTO_CONTINUE", "scheduler.auto_continue"),
    ("CAMWATCH_SCHEDULER_CAPACITY_RETRY_SECS", "scheduler.capacity_retry_secs"),
    ("CAMWATCH_STORAGE_ARTIFACTS_DIR", "storage.artifacts_dir"),
    ("CAMWATCH_NOTIFY_WEBHOOK_URL", "notify.webhook_url"),
];

impl Config {
    /// Load configuration from environment variables and optional .env file
    pub fn load() -> Result<Self> {
        let defaults = SchedulerConfig::default();
        let mut builder = ConfigBuilder::builder()
            .set_default("database.path", "camwatch.db")?
            .set_default("database.pool_size", 10)?
            .set_default("database.sqlite_wal", true)?
            .set_default("scheduler.stream_slots", defaults.stream_slots as i64)?
            .set_default("scheduler.detection_slots", defaults.detection_slots as i64)?
            .set_default("scheduler.batch_size", defaults.batch_size as i64)?
            .set_default("scheduler.cycle_duration_secs", defaults.cycle_duration_secs)?
            .set_default("scheduler.poll_interval_secs", defaults.poll_interval_secs)?
            .set_default("scheduler.detection_timeout_secs", defaults.detection_timeout_secs)?
            .set_default("scheduler.frame_interval_ms", defaults.frame_interval_ms)?
            .set_default("scheduler.frame_timeout_ms", defaults.frame_timeout_ms)?
            .set_default("scheduler.degrade_after_failures", defaults.degrade_after_failures)?
            .set_default("scheduler.capacity_policy", "partial")?
            .set_default("scheduler.auto_continue", defaults.auto_continue)?
            .set_default("scheduler.capacity_retry_secs", defaults.capacity_retry_secs)?
            .set_default("storage.artifacts_dir", "./data/detections")?
            .set_default("telemetry.environment", "development")?;

        for (var, key) in EXPLICIT_ENV_KEYS {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_override(*key, value)?;
            }
        }

        // Try to load from .env file if it exists (optional)
        if std::path::Path::new(".env").exists() {
            builder = builder.add_source(File::with_name(".env").required(false));
        }

        // Single-word keys (database.path, telemetry.environment)
        builder = builder.add_source(
            Environment::with_prefix("CAMWATCH")
                .try_parsing(true)
                .separator("_"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that touch process environment
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for (var, _) in EXPLICIT_ENV_KEYS {
            env::remove_var(var);
        }
        env::remove_var("CAMWATCH_DATABASE_PATH");
        env::remove_var("CAMWATCH_TELEMETRY_ENVIRONMENT");
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        let config = Config::load().expect("Should load with defaults");

        assert_eq!(config.database.path, "camwatch.db");
        assert_eq!(config.scheduler.stream_slots, 20);
        assert_eq!(config.scheduler.detection_slots, 20);
        assert_eq!(config.scheduler.batch_size, 20);
        assert_eq!(config.scheduler.capacity_policy, CapacityPolicySetting::Partial);
        assert!(config.scheduler.auto_continue);
        assert_eq!(config.scheduler.detection_timeout(), Duration::from_secs(30));
        assert!(config.notify.webhook_url.is_none());
    }

    #[test]
    fn test_config_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        env::set_var("CAMWATCH_SCHEDULER_STREAM_SLOTS", "8");
        env::set_var("CAMWATCH_SCHEDULER_CAPACITY_POLICY", "all_or_nothing");
        env::set_var("CAMWATCH_DATABASE_PATH", "/tmp/other.db");

        let config = Config::load().expect("Should load from env");

        assert_eq!(config.scheduler.stream_slots, 8);
        assert_eq!(
            config.scheduler.capacity_policy,
            CapacityPolicySetting::AllOrNothing
        );
        assert_eq!(config.database.path, "/tmp/other.db");

        clear_env();
    }

    #[test]
    fn test_config_validation_failure() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        env::set_var("CAMWATCH_SCHEDULER_DETECTION_SLOTS", "0");
        assert!(Config::load().is_err());

        clear_env();
    }

    #[test]
    fn test_webhook_url_must_be_http() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        env::set_var("CAMWATCH_NOTIFY_WEBHOOK_URL", "ftp://example.com/hook");
        assert!(Config::load().is_err());

        env::set_var("CAMWATCH_NOTIFY_WEBHOOK_URL", "https://example.com/hook");
        let config = Config::load().expect("https webhook should be accepted");
        assert_eq!(
            config.notify.webhook_url.as_deref(),
            Some("https://example.com/hook")
        );

        clear_env();
    }
}
