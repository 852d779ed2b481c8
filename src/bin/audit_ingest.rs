//! audit-ingest: audit event ingestion and query service
//!
//! ## Architecture
//! ```text
//! [RabbitMQ queue] -> [Dispatcher] -> [WorkerPool x N] -> [AuditStore]
//!                                                              ^
//!                     [gRPC client] -> [AuditQuery/FindAudit] -+
//! ```
//!
//! SIGINT/SIGTERM moves the pipeline to Draining: intake stops, in-flight
//! deliveries are settled, the broker connection is closed and the query
//! server shuts down.
//!
//! ## Configuration
//! - `--config <path>`: YAML configuration file
//! - AUDIT_INGEST_CONFIG: YAML configuration file
//! - AUDIT_INGEST__<SECTION>__<KEY>: per-key overrides
//! - AUDIT_INGEST_LOG: log filter (default "info")

use std::sync::Arc;

use tokio::sync::oneshot;
use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::{error, info};

use audit_ingest::config::{Config, MessagingConfig};
use audit_ingest::ingest::shutdown_signal;
use audit_ingest::proto::audit_query_server::AuditQueryServer;
use audit_ingest::services::{bind_query_listener, AuditQueryService};
use audit_ingest::storage::{init_storage, AuditStore};
use audit_ingest::utils::bootstrap::{init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path(std::env::args());
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    info!("Starting audit-ingest");

    let store = init_storage(&config.storage).await.map_err(|e| {
        error!(error = %e, "Failed to initialize storage");
        e
    })?;

    let addr = config.server.socket_addr()?;
    let incoming = bind_query_listener(addr).await.map_err(|e| {
        error!(error = %e, "Failed to start query server");
        e
    })?;

    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<AuditQueryServer<AuditQueryService>>()
        .await;

    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let mut server = tokio::spawn(
        Server::builder()
            .add_service(health_service)
            .add_service(AuditQueryServer::new(AuditQueryService::new(store.clone())))
            .serve_with_incoming_shutdown(incoming, async {
                let _ = server_stopped.await;
            }),
    );
    info!(%addr, "Query server listening");

    let ingest = async {
        match &config.messaging {
            Some(messaging) => run_pipeline(&config, messaging, store).await,
            None => {
                info!("No messaging configured, serving queries only");
                shutdown_signal().await;
                Ok(())
            }
        }
    };

    let ingested = tokio::select! {
        result = ingest => result,
        joined = &mut server => {
            let err: Box<dyn std::error::Error> = match joined {
                Ok(Ok(())) => "query server exited unexpectedly".into(),
                Ok(Err(e)) => e.into(),
                Err(e) => e.into(),
            };
            error!(error = %err, "Query server stopped, shutting down");
            return Err(err);
        }
    };

    health_reporter
        .set_not_serving::<AuditQueryServer<AuditQueryService>>()
        .await;
    let _ = stop_server.send(());
    server.await??;

    ingested?;
    info!("audit-ingest stopped");
    Ok(())
}

#[cfg(feature = "amqp")]
async fn run_pipeline(
    config: &Config,
    messaging: &MessagingConfig,
    store: Arc<dyn AuditStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    use audit_ingest::ingest::{AmqpDispatcher, Dispatcher, ShutdownCoordinator, WorkerPool};

    let dispatcher = AmqpDispatcher::connect(&messaging.amqp, config.ingest.prefetch())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start AMQP dispatcher");
            e
        })?;

    let pool = WorkerPool::from_config(store, &config.ingest);
    let running = pool.start(dispatcher.deliveries());

    let coordinator = ShutdownCoordinator::new(config.ingest.drain_timeout());
    let report = coordinator
        .run(&dispatcher, running, shutdown_signal())
        .await?;

    info!(
        processed = report.processed(),
        aborted = report.aborted,
        "Ingestion pipeline stopped"
    );
    Ok(())
}

#[cfg(not(feature = "amqp"))]
async fn run_pipeline(
    _config: &Config,
    _messaging: &MessagingConfig,
    _store: Arc<dyn AuditStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    error!("Messaging configured but the 'amqp' feature is not enabled");
    Err("amqp feature not enabled".into())
}
