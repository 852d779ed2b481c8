//! PostgreSQL AuditStore implementation.
//!
//! Statements come from sea-query and values are bound positionally through
//! sea-query-binder. Inserts are idempotent on `event_id` so a redelivered
//! message that was already stored is acknowledged like a fresh one.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{OnConflict, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::config::PostgresConfig;
use crate::model::{AuditEvent, AuditFilter, AuditPage, Pagination};
use crate::storage::query::AuditQueryBuilder;
use crate::storage::schema::{AuditEvents, ALL_COLUMNS};
use crate::storage::{AuditStore, Result};
use crate::utils::retry::{connect_with_retry, connection_backoff, redact_url};

/// PostgreSQL implementation of AuditStore.
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with retry, apply pending migrations and return the store.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let options = connect_options(config)?;
        let address = match &config.uri {
            Some(uri) => redact_url(uri),
            None => format!("{}:{}/{}", config.host, config.port, config.db_name),
        };

        let pool = connect_with_retry("postgres", &address, connection_backoff(), || {
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(options.clone())
        })
        .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply pending migrations from `migrations/postgres`.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("migrations/postgres").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Build connect options from either the URI or the discrete fields.
fn connect_options(config: &PostgresConfig) -> Result<PgConnectOptions> {
    if let Some(uri) = &config.uri {
        return Ok(PgConnectOptions::from_str(uri)?);
    }

    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.db_name)
        .ssl_mode(PgSslMode::from_str(&config.sslmode)?);
    if !config.password.is_empty() {
        options = options.password(&config.password);
    }
    if !config.timezone.is_empty() {
        options = options.options([("TimeZone", config.timezone.as_str())]);
    }
    Ok(options)
}

fn row_to_event(row: &PgRow) -> Result<AuditEvent> {
    Ok(AuditEvent {
        event_id: row.try_get::<Uuid, _>("event_id")?,
        timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
        action: row.try_get("action")?,
        status: row.try_get("status")?,
        actor_id: row.try_get("actor_id")?,
        actor_type: row.try_get("actor_type")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        resource: row.try_get("resource")?,
        resource_id: row.try_get("resource_id")?,
        details: row.try_get("details")?,
        service_name: row.try_get("service_name")?,
    })
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn save(&self, event: &AuditEvent) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(AuditEvents::Table)
            .columns(ALL_COLUMNS)
            .values([
                event.event_id.into(),
                event.timestamp.into(),
                event.action.as_str().into(),
                event.status.as_str().into(),
                event.actor_id.as_str().into(),
                event.actor_type.as_str().into(),
                event.ip_address.clone().into(),
                event.user_agent.clone().into(),
                event.resource.clone().into(),
                event.resource_id.clone().into(),
                event.details.clone().into(),
                event.service_name.as_str().into(),
            ])?
            .on_conflict(OnConflict::column(AuditEvents::EventId).do_nothing().to_owned())
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            tracing::debug!(event_id = %event.event_id, "Event already stored");
        }
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<AuditPage> {
        let builder = AuditQueryBuilder::new(filter);

        let (count_sql, count_values) = builder.count().build_sqlx(PostgresQueryBuilder);
        let total: i64 = sqlx::query_with(&count_sql, count_values)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let (page_sql, page_values) = builder.page().build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&page_sql, page_values)
            .fetch_all(&self.pool)
            .await?;

        let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>>>()?;

        Ok(AuditPage {
            events,
            pagination: Pagination {
                page: filter.page(),
                page_size: filter.page_size(),
                total,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_from_fields() {
        let config = PostgresConfig {
            host: "db.internal".to_string(),
            port: 6543,
            db_name: "audit".to_string(),
            ..Default::default()
        };
        let options = connect_options(&config).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("audit"));
    }

    #[test]
    fn test_connect_options_from_uri() {
        let config = PostgresConfig {
            uri: Some("postgres://u:p@pg:5433/events".to_string()),
            ..Default::default()
        };
        let options = connect_options(&config).unwrap();
        assert_eq!(options.get_host(), "pg");
        assert_eq!(options.get_port(), 5433);
    }

    #[test]
    fn test_connect_options_bad_sslmode() {
        let config = PostgresConfig {
            sslmode: "sometimes".to_string(),
            ..Default::default()
        };
        assert!(connect_options(&config).is_err());
    }
}
