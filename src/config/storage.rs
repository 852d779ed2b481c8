//! Storage configuration types.

use serde::Deserialize;

/// Storage type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Postgres,
    Memory,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// PostgreSQL-specific configuration.
    pub postgres: PostgresConfig,
}

/// PostgreSQL-specific configuration.
///
/// Either `uri` is set, or the connection is assembled from the discrete
/// fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Full connection URI. Takes precedence over the discrete fields.
    pub uri: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db_name: String,
    pub sslmode: String,
    pub timezone: String,
    /// Pool size.
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            uri: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            db_name: "audit".to_string(),
            sslmode: "disable".to_string(),
            timezone: "UTC".to_string(),
            max_connections: 10,
        }
    }
}
