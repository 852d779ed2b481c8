//! Audit event persistence.
//!
//! This module contains:
//! - `AuditStore` trait: durable save plus filtered, paginated query
//! - Implementations: PostgreSQL (feature `postgres`), in-memory
//! - `init_storage`: selects an implementation from configuration

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::model::{AuditEvent, AuditFilter, AuditPage};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod query;
#[cfg(feature = "postgres")]
pub mod schema;

pub use memory::MemoryAuditStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAuditStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "postgres")]
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[cfg(feature = "postgres")]
    #[error("Query build error: {0}")]
    Query(#[from] sea_query::error::Error),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Save timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Storage backend not supported: {0}")]
    Unsupported(String),
}

/// Durable persistence and query capability for audit events.
///
/// Implementations must be safe to call from every ingestion worker at once.
/// `save` may see the same event more than once (at-least-once delivery);
/// implementations should treat a repeated `event_id` as success.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist one event.
    async fn save(&self, event: &AuditEvent) -> Result<()>;

    /// Return one page of events matching `filter`, with the total match count.
    async fn query(&self, filter: &AuditFilter) -> Result<AuditPage>;
}

/// Initialize storage based on configuration.
///
/// For PostgreSQL this connects, applies pending migrations and returns a
/// pooled store.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn AuditStore>> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage_type = "memory", "Storage initialized");
            Ok(Arc::new(MemoryAuditStore::new()))
        }
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            let store = PostgresAuditStore::connect(&config.postgres).await?;
            info!(storage_type = "postgres", "Storage initialized");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageType::Postgres => {
            tracing::error!("PostgreSQL storage requested but 'postgres' feature is not enabled");
            Err(StorageError::Unsupported("postgres".to_string()))
        }
    }
}
