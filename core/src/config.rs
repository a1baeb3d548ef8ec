// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub nats: NatsConfig,
    pub scheduler: SchedulerSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    /// Events are published to `<subject_prefix>.<topic>`
    pub subject_prefix: String,
    #[serde(default = "default_max_age_seconds")]
    pub max_age_seconds: u64,
}

fn default_max_age_seconds() -> u64 {
    86400
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Interval between ticks driven by the scheduler binary
    pub poll_interval_seconds: u64,
    pub lock_ttl_seconds: u64,
    #[serde(default = "default_lookahead_seconds")]
    pub acquire_lookahead_seconds: i64,
    #[serde(default = "default_purge_interval_seconds")]
    pub purge_interval_seconds: u64,
    #[serde(default = "default_purge_after_seconds")]
    pub purge_after_seconds: i64,
    #[serde(default = "default_purge_batch_size")]
    pub purge_batch_size: i64,
    #[serde(default = "default_max_trigger_iterations")]
    pub max_trigger_iterations: usize,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// IANA timezone used to evaluate cron expressions
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Recorded on audit entries; falls back to $HOSTNAME
    #[serde(default)]
    pub hostname: Option<String>,
}

fn default_lookahead_seconds() -> i64 {
    60
}

fn default_purge_interval_seconds() -> u64 {
    3600
}

fn default_purge_after_seconds() -> i64 {
    24 * 60 * 60
}

fn default_purge_batch_size() -> i64 {
    100
}

fn default_max_trigger_iterations() -> usize {
    10_000
}

fn default_worker_concurrency() -> usize {
    10
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl SchedulerSettings {
    pub fn resolve_hostname(&self) -> String {
        self.hostname
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
    /// Share of new traces exported when a tracing endpoint is set
    #[serde(default = "default_trace_sample_ratio")]
    pub trace_sample_ratio: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

fn default_trace_sample_ratio() -> f64 {
    1.0
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides, not committed to git
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }

        if self.nats.url.is_empty() {
            return Err("NATS URL cannot be empty".to_string());
        }
        if self.nats.stream_name.is_empty() {
            return Err("NATS stream_name cannot be empty".to_string());
        }

        if self.scheduler.poll_interval_seconds == 0 {
            return Err("Scheduler poll_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.lock_ttl_seconds == 0 {
            return Err("Scheduler lock_ttl_seconds must be greater than 0".to_string());
        }
        if self.scheduler.acquire_lookahead_seconds < 0 {
            return Err("Scheduler acquire_lookahead_seconds cannot be negative".to_string());
        }
        if self.scheduler.purge_batch_size <= 0 {
            return Err("Scheduler purge_batch_size must be greater than 0".to_string());
        }
        if self.scheduler.max_trigger_iterations == 0 {
            return Err("Scheduler max_trigger_iterations must be greater than 0".to_string());
        }
        if self.scheduler.worker_concurrency == 0 {
            return Err("Scheduler worker_concurrency must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.observability.trace_sample_ratio) {
            return Err("Observability trace_sample_ratio must be between 0 and 1".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/scheduler".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                stream_name: "SCHEDULER_EVENTS".to_string(),
                subject_prefix: "scheduler".to_string(),
                max_age_seconds: default_max_age_seconds(),
            },
            scheduler: SchedulerSettings {
                poll_interval_seconds: 5,
                lock_ttl_seconds: 20,
                acquire_lookahead_seconds: default_lookahead_seconds(),
                purge_interval_seconds: default_purge_interval_seconds(),
                purge_after_seconds: default_purge_after_seconds(),
                purge_batch_size: default_purge_batch_size(),
                max_trigger_iterations: default_max_trigger_iterations(),
                worker_concurrency: default_worker_concurrency(),
                timezone: default_timezone(),
                hostname: None,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::default(),
                metrics_port: 9090,
                tracing_endpoint: None,
                trace_sample_ratio: default_trace_sample_ratio(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scheduler.lock_ttl_seconds, 20);
        assert_eq!(settings.scheduler.acquire_lookahead_seconds, 60);
        assert_eq!(settings.scheduler.purge_batch_size, 100);
    }

    #[test]
    fn test_validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_poll_interval() {
        let mut settings = Settings::default();
        settings.scheduler.poll_interval_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_out_of_range_sample_ratio() {
        let mut settings = Settings::default();
        settings.observability.trace_sample_ratio = 1.5;
        assert!(settings.validate().is_err());
        settings.observability.trace_sample_ratio = 0.1;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_log_format_from_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[observability]\nlog_level = \"debug\"\nlog_format = \"pretty\"\nmetrics_port = 9100\n",
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.observability.log_format, LogFormat::Pretty);
        assert_eq!(settings.observability.trace_sample_ratio, 1.0);
    }

    #[test]
    fn test_explicit_hostname_wins() {
        let mut settings = Settings::default();
        settings.scheduler.hostname = Some("node-7".to_string());
        assert_eq!(settings.scheduler.resolve_hostname(), "node-7");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[scheduler]
poll_interval_seconds = 2
lock_ttl_seconds = 15
timezone = "Asia/Tokyo"
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.scheduler.poll_interval_seconds, 2);
        assert_eq!(settings.scheduler.lock_ttl_seconds, 15);
        assert_eq!(settings.scheduler.timezone, "Asia/Tokyo");
        // Untouched sections keep their defaults
        assert_eq!(settings.scheduler.purge_batch_size, 100);
        assert_eq!(settings.redis.url, "redis://localhost:6379");
    }
}
