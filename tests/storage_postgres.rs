//! PostgreSQL AuditStore integration tests using testcontainers.
//!
//! Run with: cargo test --test storage_postgres --features postgres -- --ignored --nocapture
//!
//! These tests spin up PostgreSQL in a container, connect through
//! `PostgresAuditStore::connect` (which applies migrations) and exercise
//! save and query against the real schema.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use audit_ingest::config::PostgresConfig;
use audit_ingest::model::{AuditEvent, AuditFilter, SortField, SortOrder};
use audit_ingest::storage::{AuditStore, PostgresAuditStore};

/// Start PostgreSQL container.
///
/// Returns (container, connection_string).
async fn start_postgres() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ));

    let container = image
        .with_env_var("POSTGRES_USER", "audit")
        .with_env_var("POSTGRES_PASSWORD", "audit")
        .with_env_var("POSTGRES_DB", "audit")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    // The ready message is printed once during init and again when serving.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let host_port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let connection_string = format!("postgres://audit:audit@{}:{}/audit", host, host_port);
    println!("PostgreSQL available at: {}", connection_string);

    (container, connection_string)
}

async fn connect(connection_string: &str) -> PostgresAuditStore {
    let config = PostgresConfig {
        uri: Some(connection_string.to_string()),
        max_connections: 4,
        ..Default::default()
    };
    PostgresAuditStore::connect(&config)
        .await
        .expect("Failed to connect to PostgreSQL")
}

fn day(d: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 9, 30, 0).unwrap()
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_save_and_read_back() {
    let (_container, url) = start_postgres().await;
    let store = connect(&url).await;

    let event = AuditEvent::new("invoice.paid", "success", "u-7", "user", "billing")
        .at(day(1))
        .with_resource("invoice", "inv-1")
        .with_client("10.0.0.9", "curl/8.4")
        .with_details(serde_json::json!({"amount": 1200, "currency": "EUR"}));
    store.save(&event).await.expect("save");

    let page = store.query(&AuditFilter::default()).await.expect("query");
    assert_eq!(page.pagination.total, 1);
    assert_eq!(page.events, vec![event]);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_duplicate_event_id_is_idempotent() {
    let (_container, url) = start_postgres().await;
    let store = connect(&url).await;

    let event = AuditEvent::new("login", "success", "u-1", "user", "auth").at(day(2));
    store.save(&event).await.expect("first save");
    store.save(&event).await.expect("redelivered save");

    let page = store.query(&AuditFilter::default()).await.expect("query");
    assert_eq!(page.pagination.total, 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_reconnect_reapplies_migrations() {
    let (_container, url) = start_postgres().await;
    let first = connect(&url).await;
    first
        .save(&AuditEvent::new("login", "success", "u-1", "user", "auth"))
        .await
        .expect("save");

    let second = connect(&url).await;
    let page = second.query(&AuditFilter::default()).await.expect("query");
    assert_eq!(page.pagination.total, 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_filter_sort_and_paginate() {
    let (_container, url) = start_postgres().await;
    let store = connect(&url).await;

    let rows = [
        ("login", "success", "alice", "auth", 1),
        ("login", "failure", "alice", "auth", 2),
        ("invoice.void", "success", "bob", "billing", 3),
        ("login", "success", "carol", "auth", 4),
        ("invoice.paid", "success", "alice", "billing", 5),
    ];
    for (action, status, actor, service, d) in rows {
        let event = AuditEvent::new(action, status, actor, "user", service).at(day(d));
        store.save(&event).await.expect("save");
    }

    // Combined predicates.
    let page = store
        .query(&AuditFilter {
            action: Some("login".to_string()),
            service_name: Some("auth".to_string()),
            status: Some("success".to_string()),
            ..Default::default()
        })
        .await
        .expect("query");
    assert_eq!(page.pagination.total, 2);
    let actors: Vec<&str> = page.events.iter().map(|e| e.actor_id.as_str()).collect();
    assert_eq!(actors, ["carol", "alice"]);

    // Inclusive time window, ascending.
    let page = store
        .query(&AuditFilter {
            start_time: Some(day(2)),
            end_time: Some(day(4)),
            sort_order: SortOrder::Asc,
            ..Default::default()
        })
        .await
        .expect("query");
    let stamps: Vec<_> = page.events.iter().map(|e| e.timestamp).collect();
    assert_eq!(stamps, vec![day(2), day(3), day(4)]);

    // Total reflects the filter, not the page.
    let page = store
        .query(&AuditFilter {
            sort_by: SortField::ActorId,
            sort_order: SortOrder::Asc,
            page: 2,
            page_size: 2,
            ..Default::default()
        })
        .await
        .expect("query");
    assert_eq!(page.pagination.total, 5);
    assert_eq!(page.pagination.page, 2);
    let actors: Vec<&str> = page.events.iter().map(|e| e.actor_id.as_str()).collect();
    assert_eq!(actors, ["alice", "bob"]);

    // Past the end is empty but still counts.
    let page = store
        .query(&AuditFilter {
            page: 9,
            page_size: 2,
            ..Default::default()
        })
        .await
        .expect("query");
    assert!(page.events.is_empty());
    assert_eq!(page.pagination.total, 5);
}
