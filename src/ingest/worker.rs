//! Worker pool: decode, persist, settle.
//!
//! Every worker runs the same loop against the shared `DeliveryStream`:
//!
//! | outcome                     | settlement            |
//! |-----------------------------|-----------------------|
//! | body does not decode        | reject, no requeue    |
//! | `save` fails or times out   | reject, requeue       |
//! | `save` succeeds             | ack                   |
//!
//! A worker only exits when the stream reports end of intake. Failures on a
//! single delivery are logged and never end the loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::{Delivery, DeliveryStream};
use crate::config::IngestConfig;
use crate::model::AuditEvent;
use crate::storage::{AuditStore, StorageError};

/// How a worker settled one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Reject,
    Requeue,
}

/// Per-worker counters, returned when the worker exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    /// Ack or nack calls the broker refused.
    pub settle_failures: u64,
}

impl WorkerReport {
    fn record(&mut self, settlement: Settlement, delivered: bool) {
        match settlement {
            Settlement::Ack => self.acked += 1,
            Settlement::Reject => self.rejected += 1,
            Settlement::Requeue => self.requeued += 1,
        }
        if !delivered {
            self.settle_failures += 1;
        }
    }

    pub fn processed(&self) -> u64 {
        self.acked + self.rejected + self.requeued
    }
}

/// Aggregate of every worker's report after the pool has joined.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub workers: Vec<WorkerReport>,
    /// Workers cut off by the drain deadline. Their in-flight deliveries are
    /// left unsettled for the broker to redeliver.
    pub aborted: usize,
}

impl PoolReport {
    pub fn acked(&self) -> u64 {
        self.workers.iter().map(|w| w.acked).sum()
    }

    pub fn rejected(&self) -> u64 {
        self.workers.iter().map(|w| w.rejected).sum()
    }

    pub fn requeued(&self) -> u64 {
        self.workers.iter().map(|w| w.requeued).sum()
    }

    pub fn processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed()).sum()
    }
}

/// Fixed-size pool of ingestion workers.
#[derive(Clone)]
pub struct WorkerPool {
    concurrency: usize,
    save_timeout: Duration,
    store: Arc<dyn AuditStore>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn AuditStore>, concurrency: usize, save_timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            save_timeout,
            store,
        }
    }

    pub fn from_config(store: Arc<dyn AuditStore>, config: &IngestConfig) -> Self {
        Self::new(store, config.concurrency(), config.save_timeout())
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawn `concurrency` workers draining `stream`.
    pub fn start(&self, stream: Arc<dyn DeliveryStream>) -> RunningPool {
        info!(
            workers = self.concurrency,
            save_timeout_ms = self.save_timeout.as_millis() as u64,
            "Starting worker pool"
        );

        let live = Arc::new(AtomicUsize::new(self.concurrency));
        let exited = Arc::new(Notify::new());

        let handles = (0..self.concurrency)
            .map(|worker_id| {
                let stream = stream.clone();
                let store = self.store.clone();
                let save_timeout = self.save_timeout;
                let live = live.clone();
                let exited = exited.clone();
                tokio::spawn(
                    async move {
                        let report = run_worker(worker_id, stream, store, save_timeout).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                        exited.notify_waiters();
                        report
                    }
                    .instrument(tracing::info_span!("ingest.worker", worker = worker_id)),
                )
            })
            .collect();

        RunningPool {
            handles,
            live,
            exited,
        }
    }
}

/// Handles to a started pool.
pub struct RunningPool {
    handles: Vec<JoinHandle<WorkerReport>>,
    live: Arc<AtomicUsize>,
    exited: Arc<Notify>,
}

impl RunningPool {
    /// Resolves once every worker has left its loop on its own, which only
    /// happens when the delivery stream ends.
    pub async fn finished(&self) {
        loop {
            let exited = self.exited.notified();
            if self.live.load(Ordering::SeqCst) == 0 {
                return;
            }
            exited.await;
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) -> PoolReport {
        self.join_within(None).await
    }

    /// Wait for every worker to exit, aborting any still running when
    /// `deadline` (if any) elapses. Aborted workers are awaited too, so no
    /// worker task is alive when this returns.
    pub async fn join_within(self, deadline: Option<Duration>) -> PoolReport {
        let deadline = deadline.map(|d| Instant::now() + d);
        let mut report = PoolReport::default();

        for (worker_id, mut handle) in self.handles.into_iter().enumerate() {
            let joined = match deadline {
                Some(at) => match tokio::time::timeout_at(at, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(worker = worker_id, "Worker still busy at drain deadline, aborting");
                        handle.abort();
                        // Wait for the task to unwind so its delivery is
                        // dropped before the broker is released.
                        let _ = handle.await;
                        report.aborted += 1;
                        continue;
                    }
                },
                None => handle.await,
            };

            match joined {
                Ok(worker) => report.workers.push(worker),
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Worker task failed");
                    report.aborted += 1;
                }
            }
        }

        report
    }
}

async fn run_worker(
    worker_id: usize,
    stream: Arc<dyn DeliveryStream>,
    store: Arc<dyn AuditStore>,
    save_timeout: Duration,
) -> WorkerReport {
    debug!(worker = worker_id, "Worker started");
    let mut report = WorkerReport {
        worker_id,
        ..Default::default()
    };

    while let Some(delivery) = stream.next_delivery().await {
        let tag = delivery.tag();
        let (settlement, delivered) = process(worker_id, delivery, store.as_ref(), save_timeout)
            .instrument(tracing::debug_span!("ingest.delivery", delivery_tag = tag))
            .await;
        report.record(settlement, delivered);
    }

    debug!(
        worker = worker_id,
        acked = report.acked,
        rejected = report.rejected,
        requeued = report.requeued,
        "Worker stopped"
    );
    report
}

/// Handle one delivery end to end. Returns the settlement chosen and whether
/// the broker accepted it.
async fn process(
    worker_id: usize,
    delivery: Box<dyn Delivery>,
    store: &dyn AuditStore,
    save_timeout: Duration,
) -> (Settlement, bool) {
    let tag = delivery.tag();

    let event = match AuditEvent::decode(delivery.body()) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                worker = worker_id,
                delivery_tag = tag,
                error = %e,
                "Malformed audit event, rejecting without requeue"
            );
            return settle(worker_id, tag, delivery, Settlement::Reject).await;
        }
    };

    let saved = match tokio::time::timeout(save_timeout, store.save(&event)).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(save_timeout)),
    };

    match saved {
        Ok(()) => {
            debug!(worker = worker_id, delivery_tag = tag, event_id = %event.event_id, "Audit event stored");
            settle(worker_id, tag, delivery, Settlement::Ack).await
        }
        Err(e) => {
            warn!(
                worker = worker_id,
                delivery_tag = tag,
                event_id = %event.event_id,
                error = %e,
                "Failed to store audit event, requeueing"
            );
            settle(worker_id, tag, delivery, Settlement::Requeue).await
        }
    }
}

async fn settle(
    worker_id: usize,
    tag: u64,
    delivery: Box<dyn Delivery>,
    settlement: Settlement,
) -> (Settlement, bool) {
    let result = match settlement {
        Settlement::Ack => delivery.ack().await,
        Settlement::Reject => delivery.reject(false).await,
        Settlement::Requeue => delivery.reject(true).await,
    };

    match result {
        Ok(()) => (settlement, true),
        Err(e) => {
            error!(
                worker = worker_id,
                delivery_tag = tag,
                settlement = ?settlement,
                error = %e,
                "Failed to settle delivery"
            );
            (settlement, false)
        }
    }
}
