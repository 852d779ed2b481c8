//! PostgreSQL implementation of the audit store.

mod audit_store;

pub use audit_store::PostgresAuditStore;
