//! In-memory channel dispatcher.
//!
//! A single-process stand-in for the broker: a publisher handle pushes
//! message bodies, workers pull them through the usual `DeliveryStream`, and
//! every settlement is written to a `DeliveryLedger`. The prefetch window is
//! enforced with a semaphore, so at most `prefetch` deliveries are unsettled
//! at any time.
//!
//! Rejected-with-requeue messages are recorded but not redelivered.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::{Delivery, DeliveryStream, Dispatcher, IngestError, IntakeGate, Result};

/// How a delivery left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Rejected { requeue: bool },
    /// Never settled by a worker; handed back on release or dropped unsettled.
    Returned,
}

/// Append-only record of delivery outcomes, in settlement order.
#[derive(Default)]
pub struct DeliveryLedger {
    outcomes: Mutex<Vec<(u64, Outcome)>>,
    changed: Notify,
}

impl DeliveryLedger {
    fn record(&self, tag: u64, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((tag, outcome));
        self.changed.notify_waiters();
    }

    /// Snapshot of `(delivery_tag, outcome)` pairs.
    pub fn outcomes(&self) -> Vec<(u64, Outcome)> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every outcome recorded for `tag`. More than one entry means the
    /// delivery was settled twice.
    pub fn outcomes_for(&self, tag: u64) -> Vec<Outcome> {
        self.outcomes()
            .into_iter()
            .filter(|(t, _)| *t == tag)
            .map(|(_, o)| o)
            .collect()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes()
            .into_iter()
            .filter(|(_, o)| *o == outcome)
            .count()
    }

    /// Wait until at least `n` outcomes have been recorded.
    pub async fn wait_for(&self, n: usize) {
        loop {
            let changed = self.changed.notified();
            if self.len() >= n {
                return;
            }
            changed.await;
        }
    }
}

type Message = (u64, Vec<u8>);

/// Producer side of the in-memory queue.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Message>,
    next_tag: Arc<AtomicU64>,
}

impl ChannelPublisher {
    /// Enqueue one message body, returning its delivery tag.
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Result<u64> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send((tag, body.into()))
            .map_err(|_| IngestError::Connection("channel dispatcher released".to_string()))?;
        Ok(tag)
    }
}

struct ChannelStream {
    rx: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    gate: IntakeGate,
    window: Arc<Semaphore>,
    ledger: Arc<DeliveryLedger>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

#[async_trait]
impl DeliveryStream for ChannelStream {
    async fn next_delivery(&self) -> Option<Box<dyn Delivery>> {
        if !self.gate.is_open() {
            return None;
        }

        let permit = tokio::select! {
            biased;
            _ = self.gate.closed() => return None,
            permit = self.window.clone().acquire_owned() => permit.ok()?,
        };

        let mut rx = self.rx.lock().await;
        let (tag, body) = tokio::select! {
            biased;
            _ = self.gate.closed() => return None,
            message = rx.recv() => message?,
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        Some(Box::new(ChannelDelivery {
            tag,
            body,
            settled: false,
            ledger: self.ledger.clone(),
            in_flight: self.in_flight.clone(),
            _permit: permit,
        }))
    }
}

struct ChannelDelivery {
    tag: u64,
    body: Vec<u8>,
    settled: bool,
    ledger: Arc<DeliveryLedger>,
    in_flight: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl ChannelDelivery {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.ledger.record(self.tag, outcome);
    }
}

impl Drop for ChannelDelivery {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Outcome::Returned);
        }
    }
}

#[async_trait]
impl Delivery for ChannelDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn tag(&self) -> u64 {
        self.tag
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        let mut delivery = self;
        delivery.settle(Outcome::Acked);
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        let mut delivery = self;
        delivery.settle(Outcome::Rejected { requeue });
        Ok(())
    }
}

/// Dispatcher over an in-process unbounded queue.
pub struct ChannelDispatcher {
    stream: Arc<ChannelStream>,
}

impl ChannelDispatcher {
    /// Create a dispatcher with the given prefetch window and its publisher.
    ///
    /// A `prefetch` of zero is treated as one.
    pub fn new(prefetch: usize) -> (Self, ChannelPublisher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = Arc::new(ChannelStream {
            rx: AsyncMutex::new(rx),
            gate: IntakeGate::new(),
            window: Arc::new(Semaphore::new(prefetch.max(1))),
            ledger: Arc::new(DeliveryLedger::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        });
        let publisher = ChannelPublisher {
            tx,
            next_tag: Arc::new(AtomicU64::new(1)),
        };

        info!(prefetch = prefetch.max(1), "Channel dispatcher initialized");
        (Self { stream }, publisher)
    }

    pub fn ledger(&self) -> Arc<DeliveryLedger> {
        self.stream.ledger.clone()
    }

    /// Deliveries handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.stream.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously unsettled deliveries observed.
    pub fn peak_in_flight(&self) -> usize {
        self.stream.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_intake_open(&self) -> bool {
        self.stream.gate.is_open()
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    fn deliveries(&self) -> Arc<dyn DeliveryStream> {
        self.stream.clone()
    }

    async fn stop_intake(&self) -> Result<()> {
        self.stream.gate.close();
        debug!("Channel dispatcher intake stopped");
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.stream.gate.close();
        let mut rx = self.stream.rx.lock().await;
        rx.close();

        let mut returned = 0usize;
        while let Ok((tag, _)) = rx.try_recv() {
            self.stream.ledger.record(tag, Outcome::Returned);
            returned += 1;
        }
        info!(returned, "Channel dispatcher released");
        Ok(())
    }
}
