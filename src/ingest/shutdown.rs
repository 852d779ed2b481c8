//! Shutdown coordination for the ingestion pipeline.
//!
//! ```text
//! Running ──signal──▶ Draining ──workers joined, broker released──▶ Stopped
//! ```
//!
//! Draining stops intake first and leaves the channel open, so deliveries
//! already held by workers can still be acked or nacked. Broker resources
//! are released only after the pool has joined.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::worker::{PoolReport, RunningPool};
use super::{Dispatcher, IngestError, Result};

/// Lifecycle state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Drives one pipeline from Running to Stopped.
pub struct ShutdownCoordinator {
    state: watch::Sender<PipelineState>,
    drain_timeout: Option<Duration>,
}

impl ShutdownCoordinator {
    /// `drain_timeout` bounds how long Draining may wait for workers. With
    /// `None` the wait is bounded only by the per-save timeout.
    pub fn new(drain_timeout: Option<Duration>) -> Self {
        let (state, _) = watch::channel(PipelineState::Running);
        Self {
            state,
            drain_timeout,
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    fn transition(&self, to: PipelineState) {
        let from = self.state.send_replace(to);
        info!(from = from.as_str(), state = to.as_str(), "Pipeline state changed");
    }

    /// Run until `signal` resolves (or every worker exits because the broker
    /// ended the stream), then drain and release.
    ///
    /// Returns the pool report once Stopped. A failure to release broker
    /// resources, or a stream that ended without `signal`, is returned as an
    /// error after the state has still moved to Stopped.
    pub async fn run<S>(
        &self,
        dispatcher: &dyn Dispatcher,
        pool: RunningPool,
        signal: S,
    ) -> Result<PoolReport>
    where
        S: Future<Output = ()>,
    {
        info!(workers = pool.len(), state = PipelineState::Running.as_str(), "Pipeline running");

        let stream_ended = tokio::select! {
            biased;
            _ = signal => {
                info!("Shutdown signal received");
                false
            }
            _ = pool.finished() => {
                error!("Delivery stream ended before shutdown signal");
                true
            }
        };

        self.transition(PipelineState::Draining);
        if let Err(e) = dispatcher.stop_intake().await {
            // Workers still stop on the in-process gate; the broker will
            // reclaim anything it pushed after this point when we release.
            warn!(error = %e, "Failed to cancel broker consumer");
        }

        let report = pool.join_within(self.drain_timeout).await;
        info!(
            acked = report.acked(),
            rejected = report.rejected(),
            requeued = report.requeued(),
            aborted = report.aborted,
            "Worker pool drained"
        );

        let released = dispatcher.release().await;
        if let Err(e) = &released {
            error!(error = %e, "Failed to release broker resources");
        }
        self.transition(PipelineState::Stopped);

        released?;
        if stream_ended {
            return Err(IngestError::StreamEnded);
        }
        Ok(report)
    }
}

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
