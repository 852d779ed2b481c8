//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod ingest;
mod messaging;
mod server;
mod storage;

pub use ingest::{IngestConfig, DEFAULT_READ_CONCURRENCY, DEFAULT_SAVE_TIMEOUT_SECS};
pub use messaging::{AmqpConfig, MessagingConfig};
pub use server::ServerConfig;
pub use storage::{PostgresConfig, StorageConfig, StorageType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "AUDIT_INGEST_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "AUDIT_INGEST";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "AUDIT_INGEST_LOG";
/// Environment variable selecting the log output format (`json` or human).
pub const LOG_FORMAT_ENV_VAR: &str = "AUDIT_INGEST_LOG_FORMAT";

/// Errors raised while assembling configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// gRPC query server.
    pub server: ServerConfig,
    /// Audit store backend.
    pub storage: StorageConfig,
    /// Broker connection. Absent means the process only serves queries.
    pub messaging: Option<MessagingConfig>,
    /// Worker pool and shutdown tuning.
    pub ingest: IngestConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that deserialize but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(messaging) = &self.messaging {
            if messaging.amqp.queue_name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "messaging.amqp.queue_name must not be empty".to_string(),
                ));
            }
        }
        if self.ingest.save_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "ingest.save_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing: in-memory store, no broker.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig {
                storage_type: StorageType::Memory,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
