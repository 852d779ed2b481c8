//! Ingestion pipeline: broker deliveries in, stored audit events out.
//!
//! This module contains:
//! - `Dispatcher` trait: owns the broker side and hands out a `DeliveryStream`
//! - `Delivery` trait: one message plus its single-use ack/nack handle
//! - `WorkerPool`: N workers running decode → save → ack/nack
//! - `ShutdownCoordinator`: Running → Draining → Stopped
//! - Implementations: AMQP (RabbitMQ), in-memory channel

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod shutdown;
pub mod worker;

#[cfg(feature = "amqp")]
pub use amqp::AmqpDispatcher;
pub use channel::{ChannelDispatcher, ChannelPublisher, DeliveryLedger, Outcome};
pub use shutdown::{shutdown_signal, PipelineState, ShutdownCoordinator};
pub use worker::{PoolReport, RunningPool, WorkerPool, WorkerReport};

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors raised by the broker side of the pipeline.
///
/// Everything up to `Consume` is a startup failure and is fatal.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel creation failed: {0}")]
    Channel(String),

    #[error("Queue declaration failed: {0}")]
    QueueDeclare(String),

    #[error("Setting prefetch failed: {0}")]
    Qos(String),

    #[error("Starting consumer failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Closing broker resources failed: {0}")]
    Close(String),

    /// The broker ended the delivery stream before a shutdown signal. The
    /// pipeline still drained and stopped, but can no longer ingest.
    #[error("Delivery stream ended without a shutdown signal")]
    StreamEnded,
}

/// One message handed to exactly one worker.
///
/// `ack` and `reject` consume the delivery, so each one is settled at most
/// once and by the worker that received it.
#[async_trait]
pub trait Delivery: Send {
    /// Raw message body.
    fn body(&self) -> &[u8];

    /// Broker-assigned delivery tag, for logging.
    fn tag(&self) -> u64;

    /// Positive acknowledgement: the broker forgets the message.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Negative acknowledgement. With `requeue` the broker redelivers the
    /// message, without it the message is dropped (or dead-lettered).
    async fn reject(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// Shared source of deliveries drained concurrently by every worker.
#[async_trait]
pub trait DeliveryStream: Send + Sync {
    /// Next delivery, or `None` once intake has stopped.
    ///
    /// Each delivery is returned to exactly one caller.
    async fn next_delivery(&self) -> Option<Box<dyn Delivery>>;
}

/// Broker-side owner of the connection, channel and consumer.
///
/// Workers only ever see the `DeliveryStream`; closing and releasing broker
/// resources is reserved for the shutdown coordinator.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// The stream workers pull from.
    fn deliveries(&self) -> Arc<dyn DeliveryStream>;

    /// Stop handing out deliveries. Every pending and future
    /// `next_delivery` call returns `None`. Deliveries already handed out
    /// can still be settled.
    async fn stop_intake(&self) -> Result<()>;

    /// Close the channel and connection. Call after all workers have
    /// finished; unsettled deliveries are returned to the broker.
    async fn release(&self) -> Result<()>;
}

/// Open/closed latch shared between a dispatcher and its stream.
///
/// Closing is permanent. Waiters blocked in `closed` wake immediately.
#[derive(Clone)]
pub struct IntakeGate {
    open: Arc<watch::Sender<bool>>,
}

impl Default for IntakeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl IntakeGate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self {
            open: Arc::new(open),
        }
    }

    pub fn close(&self) {
        self.open.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Resolves once the gate is closed.
    pub async fn closed(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so this cannot observe a dropped channel.
        let _ = rx.wait_for(|open| !*open).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gate_wakes_waiters_on_close() {
        let gate = IntakeGate::new();
        assert!(gate.is_open());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!gate.is_open());
    }

    #[tokio::test]
    async fn test_closed_gate_resolves_immediately() {
        let gate = IntakeGate::new();
        gate.close();
        tokio::time::timeout(Duration::from_millis(100), gate.closed())
            .await
            .unwrap();
    }
}
