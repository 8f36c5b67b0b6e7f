//! Service configuration management

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use batch_ingest::SweeperConfig;

/// Environment variable naming an optional TOML config file
pub const CONFIG_FILE_ENV: &str = "INGEST_CONFIG_FILE";

/// Longest accepted retention window (one year)
pub const MAX_RETENTION_SECS: u64 = 365 * 24 * 60 * 60;

/// Main service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub source: SourceConfig,
    pub cron: CronConfig,
    pub retention: RetentionConfig,
    pub service: ServiceSettings,
}

/// Database connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    pub url: String,

    /// Connection pool size
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or full filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

/// HTTP source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Per-request timeout in seconds
    pub http_timeout_secs: u64,
}

/// Scheduled ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub enabled: bool,

    /// Seconds between scheduled runs
    pub interval_secs: u64,

    /// Records requested per scheduled run
    pub record_count: u64,

    /// Run once at startup if no records are stored yet
    pub initial_fetch_when_empty: bool,
}

/// Job retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Jobs untouched for longer than this are deleted
    pub retention_secs: u64,

    /// Seconds between periodic sweeps
    pub sweep_interval_secs: u64,

    /// Sweep once more after each completed job
    pub post_job_sweep: bool,

    /// Delay of the post-job sweep; defaults to the retention window
    pub post_job_sweep_delay_secs: Option<u64>,
}

/// Service-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Mark jobs left running by a previous process as failed
    pub fail_orphaned_on_startup: bool,

    /// How long to wait for background tasks on shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/batch_ingest".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { http_timeout_secs: 30 }
    }
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 24 * 60 * 60,
            record_count: 5000,
            initial_fetch_when_empty: true,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            post_job_sweep: true,
            post_job_sweep_delay_secs: None,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self { fail_orphaned_on_startup: true, shutdown_timeout_secs: 10 }
    }
}

impl CronConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SourceConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl ServiceSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl RetentionConfig {
    /// Sweeper settings for the pipeline
    pub fn sweeper_config(&self) -> SweeperConfig {
        let retention = Duration::from_secs(self.retention_secs);
        let post_job_delay = self
            .post_job_sweep
            .then(|| self.post_job_sweep_delay_secs.map(Duration::from_secs).unwrap_or(retention));

        SweeperConfig {
            retention,
            interval: Duration::from_secs(self.sweep_interval_secs),
            post_job_delay,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: ServiceConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, normally `std::env::var`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_DB_MAX_CONNECTIONS")? {
            self.database.max_connections = v;
        }

        if let Some(level) = lookup("INGEST_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("INGEST_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(v) = parse_var(&lookup, "INGEST_HTTP_TIMEOUT_SECS")? {
            self.source.http_timeout_secs = v;
        }

        if let Some(v) = parse_var(&lookup, "INGEST_CRON_ENABLED")? {
            self.cron.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_CRON_INTERVAL_SECS")? {
            self.cron.interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_CRON_RECORD_COUNT")? {
            self.cron.record_count = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_CRON_INITIAL_FETCH")? {
            self.cron.initial_fetch_when_empty = v;
        }

        if let Some(v) = parse_var(&lookup, "INGEST_RETENTION_SECS")? {
            self.retention.retention_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "INGEST_SWEEP_INTERVAL_SECS")? {
            self.retention.sweep_interval_secs = v;
        }

        if let Some(v) = parse_var(&lookup, "INGEST_FAIL_ORPHANED")? {
            self.service.fail_orphaned_on_startup = v;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(anyhow!("Database URL must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow!("Database pool needs at least one connection"));
        }

        // The level may be a full EnvFilter directive; only check bare levels
        if !self.logging.level.contains('=') {
            match self.logging.level.as_str() {
                "trace" | "debug" | "info" | "warn" | "error" => {}
                _ => return Err(anyhow!("Invalid log level: {}", self.logging.level)),
            }
        }
        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            _ => return Err(anyhow!("Invalid log format: {}", self.logging.format)),
        }

        if self.source.http_timeout_secs == 0 {
            return Err(anyhow!("HTTP timeout must be positive"));
        }

        if self.cron.enabled {
            if self.cron.interval_secs == 0 {
                return Err(anyhow!("Cron interval must be positive"));
            }
            if self.cron.record_count == 0 {
                return Err(anyhow!("Cron record count must be positive"));
            }
        }

        if self.retention.retention_secs == 0 || self.retention.retention_secs > MAX_RETENTION_SECS {
            return Err(anyhow!(
                "Retention window must be between 1 and {} seconds, got {}",
                MAX_RETENTION_SECS,
                self.retention.retention_secs
            ));
        }
        if let Some(delay) = self.retention.post_job_sweep_delay_secs {
            if delay > MAX_RETENTION_SECS {
                return Err(anyhow!("Post-job sweep delay must not exceed {} seconds", MAX_RETENTION_SECS));
            }
        }
        if self.retention.sweep_interval_secs == 0 {
            return Err(anyhow!("Sweep interval must be positive"));
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| raw.trim().parse::<T>().map_err(|e| anyhow!("Invalid value for {name} ('{raw}'): {e}")))
        .transpose()
}

/// Load configuration from an optional file and the environment.
///
/// `path` wins over `INGEST_CONFIG_FILE`. A `.env` file is honoured if present.
pub fn load_config(path: Option<PathBuf>) -> Result<ServiceConfig> {
    dotenv::dotenv().ok();

    let path = path.or_else(|| std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from));
    let mut config = match &path {
        Some(path) => {
            tracing::debug!("Loading configuration from file: {:?}", path);
            ServiceConfig::from_file(path)?
        }
        None => ServiceConfig::default(),
    };

    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cron.record_count, 5000);
        assert_eq!(config.cron.interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_sweeper_config_defaults_post_job_delay_to_retention() {
        let sweeper = RetentionConfig::default().sweeper_config();
        assert_eq!(sweeper.retention, Duration::from_secs(86_400));
        assert_eq!(sweeper.interval, Duration::from_secs(3_600));
        assert_eq!(sweeper.post_job_delay, Some(Duration::from_secs(86_400)));

        let disabled = RetentionConfig { post_job_sweep: false, ..RetentionConfig::default() };
        assert_eq!(disabled.sweeper_config().post_job_delay, None);
    }

    #[test]
    fn test_overrides() {
        let mut config = ServiceConfig::default();
        config
            .apply_overrides(lookup(&[
                ("DATABASE_URL", "postgresql://db/ingest"),
                ("INGEST_LOG_FORMAT", "json"),
                ("INGEST_CRON_ENABLED", "false"),
                ("INGEST_CRON_RECORD_COUNT", "1200"),
            ]))
            .unwrap();

        assert_eq!(config.database.url, "postgresql://db/ingest");
        assert_eq!(config.logging.format, "json");
        assert!(!config.cron.enabled);
        assert_eq!(config.cron.record_count, 1200);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = ServiceConfig::default();
        let err = config.apply_overrides(lookup(&[("INGEST_CRON_INTERVAL_SECS", "daily")])).unwrap_err();
        assert!(err.to_string().contains("INGEST_CRON_INTERVAL_SECS"));
    }

    #[test]
    fn test_validation() {
        let mut config = ServiceConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.logging.level = "batch_ingest=debug,info".to_string();
        assert!(config.validate().is_ok());

        let mut config = ServiceConfig::default();
        config.cron.record_count = 0;
        assert!(config.validate().is_err());
        config.cron.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retention_window_is_bounded() {
        let mut config = ServiceConfig::default();
        config
            .apply_overrides(lookup(&[("INGEST_RETENTION_SECS", "18446744073709551615")]))
            .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Retention window"));

        config.retention.retention_secs = MAX_RETENTION_SECS;
        assert!(config.validate().is_ok());

        config.retention.post_job_sweep_delay_secs = Some(MAX_RETENTION_SECS + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cron]\nrecord_count = 750\n\n[retention]\nretention_secs = 3600").unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cron.record_count, 750);
        assert!(config.cron.enabled);
        assert_eq!(config.retention.retention_secs, 3600);
        assert_eq!(config.logging, LoggingConfig::default());
    }
}
