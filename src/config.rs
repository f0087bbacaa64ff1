/*!
 * Configuration for the pool, resilience pipelines and logging
 */

use crate::error::{PoolError, Result};
use crate::pool::PoolConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use warren_core_resilience::{
    BackoffType, CircuitBreakerPolicy, PipelineOptions, PipelineRegistry, RetryPolicy, BROKER,
    CACHE, DATABASE,
};

/// Top-level configuration, usually loaded from a TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WarrenConfig {
    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub resilience: ResilienceSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Connection pool limits and timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum number of physical connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum channels issued concurrently on one connection
    #[serde(default = "default_max_channels")]
    pub max_channels_per_connection: usize,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_channel_timeout")]
    pub channel_timeout_secs: u64,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Connections unused for longer than this are retired
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Upper bound on retries of broker calls made through the pool
    #[serde(default = "default_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_true")]
    pub enable_health_checks: bool,

    #[serde(default = "default_dispose_timeout")]
    pub dispose_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_channels_per_connection: default_max_channels(),
            connection_timeout_secs: default_connection_timeout(),
            channel_timeout_secs: default_channel_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            idle_timeout_secs: default_idle_timeout(),
            max_retry_attempts: default_retry_attempts(),
            enable_health_checks: true,
            dispose_timeout_ms: default_dispose_timeout(),
        }
    }
}

/// Backoff growth between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Constant,
    Linear,
    #[default]
    Exponential,
}

impl From<Backoff> for BackoffType {
    fn from(backoff: Backoff) -> Self {
        match backoff {
            Backoff::Constant => BackoffType::Constant,
            Backoff::Linear => BackoffType::Linear,
            Backoff::Exponential => BackoffType::Exponential,
        }
    }
}

/// Retry, circuit-breaker and timeout settings for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// How long the circuit stays open once tripped
    #[serde(default = "default_break_duration")]
    pub duration_of_break_secs: u64,

    /// Width of the sliding window outcomes are counted over
    #[serde(default = "default_sampling_duration")]
    pub sampling_duration_secs: u64,

    /// Calls the window must hold before the circuit may open
    #[serde(default = "default_minimum_throughput")]
    pub minimum_throughput: usize,

    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,

    #[serde(default = "default_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default = "default_true")]
    pub use_jitter: bool,

    /// Per-attempt timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            duration_of_break_secs: default_break_duration(),
            sampling_duration_secs: default_sampling_duration(),
            minimum_throughput: default_minimum_throughput(),
            failure_ratio: default_failure_ratio(),
            max_retry_attempts: default_retry_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff: Backoff::default(),
            use_jitter: true,
            timeout_secs: default_timeout(),
        }
    }
}

impl PipelineSettings {
    pub fn to_options(&self) -> PipelineOptions {
        PipelineOptions {
            retry: RetryPolicy {
                max_retry_attempts: self.max_retry_attempts,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                backoff: self.backoff.into(),
                use_jitter: self.use_jitter,
                ..RetryPolicy::default()
            },
            circuit_breaker: CircuitBreakerPolicy {
                failure_ratio: self.failure_ratio,
                sampling_duration: Duration::from_secs(self.sampling_duration_secs),
                minimum_throughput: self.minimum_throughput,
                break_duration: Duration::from_secs(self.duration_of_break_secs),
            },
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    fn validate(&self, resource: &str) -> Result<()> {
        let invalid = |msg: &str| Err(PoolError::Config(format!("resilience.{resource}: {msg}")));

        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return invalid("failure_ratio must be in (0, 1]");
        }
        if self.minimum_throughput == 0 {
            return invalid("minimum_throughput must be at least 1");
        }
        if self.sampling_duration_secs == 0 || self.duration_of_break_secs == 0 {
            return invalid("sampling and break durations must be greater than zero");
        }
        if self.timeout_secs == 0 {
            return invalid("timeout_secs must be greater than zero");
        }
        if self.max_delay_ms < self.base_delay_ms {
            return invalid("max_delay_ms must not be less than base_delay_ms");
        }
        Ok(())
    }
}

/// Pipelines for each downstream resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResilienceSettings {
    #[serde(default)]
    pub broker: PipelineSettings,

    #[serde(default)]
    pub cache: PipelineSettings,

    #[serde(default)]
    pub database: PipelineSettings,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoggingSettings {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON logs to this file instead of compact logs to stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    5
}

fn default_max_channels() -> usize {
    10
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_channel_timeout() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    120
}

fn default_idle_timeout() -> u64 {
    30 * 60
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_dispose_timeout() -> u64 {
    5_000
}

fn default_break_duration() -> u64 {
    30
}

fn default_sampling_duration() -> u64 {
    60
}

fn default_minimum_throughput() -> usize {
    10
}

fn default_failure_ratio() -> f64 {
    0.5
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_timeout() -> u64 {
    30
}

impl WarrenConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PoolError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: WarrenConfig = toml::from_str(contents)
            .map_err(|e| PoolError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = self.to_toml_string()?;
        std::fs::write(path, contents)
            .map_err(|e| PoolError::Config(format!("Failed to write {}: {}", path.display(), e)))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PoolError::Config(format!("Failed to serialize configuration: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.pool_config().validate()?;
        self.resilience.broker.validate(BROKER)?;
        self.resilience.cache.validate(CACHE)?;
        self.resilience.database.validate(DATABASE)?;
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let pool = &self.pool;
        PoolConfig {
            max_connections: pool.max_connections,
            max_channels_per_connection: pool.max_channels_per_connection,
            connection_timeout: Duration::from_secs(pool.connection_timeout_secs),
            channel_timeout: Duration::from_secs(pool.channel_timeout_secs),
            health_check_interval: Duration::from_secs(pool.health_check_interval_secs),
            enable_health_checks: pool.enable_health_checks,
            idle_timeout: Duration::from_secs(pool.idle_timeout_secs),
            dispose_timeout: Duration::from_millis(pool.dispose_timeout_ms),
        }
    }

    /// Build the named pipelines
    ///
    /// The broker pipeline never retries more than `pool.max_retry_attempts`.
    pub fn pipeline_registry(&self) -> PipelineRegistry {
        let mut broker = self.resilience.broker.to_options();
        broker.retry.max_retry_attempts = broker
            .retry
            .max_retry_attempts
            .min(self.pool.max_retry_attempts);

        PipelineRegistry::builder()
            .with_pipeline(BROKER, broker)
            .with_pipeline(CACHE, self.resilience.cache.to_options())
            .with_pipeline(DATABASE, self.resilience.database.to_options())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pool_defaults() {
        let config = WarrenConfig::default();
        assert_eq!(config.pool_config(), PoolConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_defaults() {
        let options = PipelineSettings::default().to_options();
        assert_eq!(options.retry.max_retry_attempts, 3);
        assert_eq!(options.retry.base_delay, Duration::from_secs(1));
        assert_eq!(options.retry.max_delay, Duration::from_secs(30));
        assert_eq!(options.retry.backoff, BackoffType::Exponential);
        assert!(options.retry.use_jitter);
        assert_eq!(options.circuit_breaker, CircuitBreakerPolicy::default());
        assert_eq!(options.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = WarrenConfig::from_toml_str(
            r#"
[pool]
max_connections = 2
channel_timeout_secs = 3

[resilience.cache]
failure_ratio = 0.25
backoff = "linear"

[logging]
level = "debug"
"#,
        )
        .unwrap();

        assert_eq!(config.pool.max_connections, 2);
        assert_eq!(config.pool.max_channels_per_connection, 10);
        assert_eq!(config.pool_config().channel_timeout, Duration::from_secs(3));
        assert_eq!(config.resilience.cache.failure_ratio, 0.25);
        assert_eq!(config.resilience.cache.backoff, Backoff::Linear);
        assert_eq!(config.resilience.broker, PipelineSettings::default());
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = WarrenConfig::from_toml_str("[pool]\nmax_connections = 0\n").unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));

        let err =
            WarrenConfig::from_toml_str("[resilience.database]\nfailure_ratio = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("resilience.database"));

        let err = WarrenConfig::from_toml_str(
            "[resilience.broker]\nbase_delay_ms = 500\nmax_delay_ms = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_delay_ms"));
    }

    #[test]
    fn test_unknown_backoff_is_rejected() {
        let result = WarrenConfig::from_toml_str("[resilience.broker]\nbackoff = \"random\"\n");
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[test]
    fn test_registry_has_well_known_pipelines() {
        let mut config = WarrenConfig::default();
        config.pool.max_retry_attempts = 1;
        config.resilience.cache.max_retry_attempts = 5;

        let registry = config.pipeline_registry();
        assert_eq!(registry.names(), vec![BROKER, CACHE, DATABASE]);
        assert_eq!(registry.get(BROKER).unwrap().retry_policy().max_retry_attempts, 1);
        assert_eq!(registry.get(CACHE).unwrap().retry_policy().max_retry_attempts, 5);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = WarrenConfig::default();
        config.logging.file = Some(PathBuf::from("/var/log/warren.json"));
        config.resilience.database.backoff = Backoff::Constant;

        let toml = config.to_toml_string().unwrap();
        assert_eq!(WarrenConfig::from_toml_str(&toml).unwrap(), config);
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warren.toml");

        let mut config = WarrenConfig::default();
        config.pool.max_connections = 8;
        config.logging.level = LogLevel::Warn;
        config.to_file(&path).unwrap();

        let loaded = WarrenConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);

        let missing = WarrenConfig::from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(PoolError::Config(_))));
    }
}
