// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Engine configuration, loaded from a TOML file with `STATQ_` environment
// overrides (`__` separates nesting levels, e.g. STATQ_SERVICE__STORE_INTERVAL).
// ============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;
use crate::queue::StatQueueConfig;

// ----------------------------------------------------------------------------
// Main Configuration
// ----------------------------------------------------------------------------

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Queue configurations written to the store at startup when absent
    #[serde(default)]
    pub queues: Vec<StatQueueConfig>,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("STATQ_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.validate()?;
        self.storage.validate()?;
        self.logging.validate()?;

        let mut seen = HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.id.as_str()) {
                return Err(ConfigError::invalid_value(
                    "queues",
                    format!("queue '{}' configured twice", queue.id),
                ));
            }
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Service Configuration
// ----------------------------------------------------------------------------

/// Stats service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Instance name (for identification in logs)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Interval between persistence passes. Zero disables the loop; dirty
    /// queues are then only written on shutdown or explicit flush.
    #[serde(default = "default_store_interval", with = "humantime_serde")]
    pub store_interval: Duration,

    /// Upper bound of the random delay added to every interval
    #[serde(default = "default_store_jitter", with = "humantime_serde")]
    pub store_jitter: Duration,

    /// Seed of the jitter generator; random when unset
    #[serde(default)]
    pub rng_seed: Option<u64>,

    /// Deadline for one snapshot write
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub store_timeout: Duration,

    /// Deadline for each store read while loading queues
    #[serde(default = "default_load_timeout", with = "humantime_serde")]
    pub load_timeout: Duration,

    /// How long shutdown waits for in-flight events
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Decimals string metrics are rounded to
    #[serde(default = "default_rounding_decimals")]
    pub rounding_decimals: u32,

    /// Load every configured queue when the service starts
    #[serde(default = "default_true")]
    pub load_on_start: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            store_interval: default_store_interval(),
            store_jitter: default_store_jitter(),
            rng_seed: None,
            store_timeout: default_store_timeout(),
            load_timeout: default_load_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            rounding_decimals: default_rounding_decimals(),
            load_on_start: true,
        }
    }
}

impl ServiceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.store_interval.is_zero() && self.store_jitter > self.store_interval {
            return Err(ConfigError::invalid_value(
                "service.store_jitter",
                "jitter cannot exceed the store interval",
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "service.store_timeout",
                "store timeout must be greater than zero",
            ));
        }
        if self.load_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "service.load_timeout",
                "load timeout must be greater than zero",
            ));
        }
        if self.rounding_decimals > MAX_ROUNDING_DECIMALS {
            return Err(ConfigError::invalid_value(
                "service.rounding_decimals",
                format!("cannot exceed {}", MAX_ROUNDING_DECIMALS),
            ));
        }
        Ok(())
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_store_interval() -> Duration {
    Duration::from_millis(DEFAULT_STORE_INTERVAL_MS)
}

fn default_store_jitter() -> Duration {
    Duration::from_millis(DEFAULT_STORE_JITTER_MS)
}

fn default_store_timeout() -> Duration {
    Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS)
}

fn default_load_timeout() -> Duration {
    Duration::from_millis(DEFAULT_LOAD_TIMEOUT_MS)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)
}

fn default_rounding_decimals() -> u32 {
    DEFAULT_ROUNDING_DECIMALS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Storage Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on exit
    Memory,
    /// One JSON document per key under `path`
    File,
}

/// Storage backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Data directory of the file backend
    #[serde(default = "default_data_dir")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_data_dir(),
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == StorageBackend::File && self.path.as_os_str().is_empty() {
            return Err(ConfigError::missing_field("storage.path"));
        }
        Ok(())
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/statq")
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "pretty" | "compact" => Ok(()),
            other => Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}', expected json, pretty or compact", other),
            )),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.service.rounding_decimals, 2);
        assert_eq!(config.storage.backend, StorageBackend::File);
    }

    #[test]
    fn test_generated_config_parses_back() {
        let generated = EngineConfig::generate_default_config();
        let parsed = EngineConfig::from_str(&generated).unwrap();
        assert_eq!(parsed.service.store_interval, default_store_interval());
        assert_eq!(parsed.logging.format, "pretty");
    }

    #[test]
    fn test_from_str_with_queues() {
        let config = EngineConfig::from_str(
            r#"
            [service]
            store_interval = "2s"
            store_jitter = "100ms"
            rng_seed = 7

            [storage]
            backend = "memory"

            [[queues]]
            id = "Q1"
            metrics = ["count", "asr"]
            store = true

            [[queues]]
            id = "Q2"
            metrics = ["acd"]
            blocker = true
            "#,
        )
        .unwrap();

        assert_eq!(config.service.store_interval, Duration::from_secs(2));
        assert_eq!(config.service.rng_seed, Some(7));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.queues[0].metrics, vec![MetricKind::Count, MetricKind::Asr]);
        assert!(config.queues[1].blocker);
    }

    #[test]
    fn test_rejects_jitter_above_interval() {
        let err = EngineConfig::from_str(
            r#"
            [service]
            store_interval = "1s"
            store_jitter = "2s"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "service.store_jitter"));
    }

    #[test]
    fn test_rejects_duplicate_queue_ids() {
        let err = EngineConfig::from_str(
            r#"
            [[queues]]
            id = "Q1"
            metrics = ["count"]

            [[queues]]
            id = "Q1"
            metrics = ["asr"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_rejects_unknown_metric() {
        let err = EngineConfig::from_str(
            r#"
            [[queues]]
            id = "Q1"
            metrics = ["median"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[service]\nrounding_decimals = 4\n").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.service.rounding_decimals, 4);

        let missing = EngineConfig::load("/nonexistent/statq.toml").unwrap_err();
        assert!(matches!(missing, ConfigError::FileNotFound { .. }));
    }
}
