//! audit-ingest - audit event ingestion service
//!
//! Consumes audit events from a RabbitMQ queue, persists them through an
//! `AuditStore` with at-least-once semantics, and serves filtered, paginated
//! lookups over gRPC.

pub mod config;
pub mod ingest;
pub mod model;
pub mod proto_ext;
pub mod services;
pub mod storage;
pub mod utils;

pub mod proto {
    tonic::include_proto!("audit");
}
