//! Worker pool and shutdown tuning.

use std::time::Duration;

use serde::Deserialize;

/// Workers used when `read_concurrency` is not positive.
pub const DEFAULT_READ_CONCURRENCY: i64 = 5;
/// Bound on a single store write.
pub const DEFAULT_SAVE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Number of concurrent workers. `<= 0` falls back to the default.
    #[serde(alias = "read_concurency")]
    pub read_concurrency: i64,
    /// Broker prefetch window. `<= 0` means "same as concurrency".
    pub prefetch: i64,
    pub save_timeout_secs: u64,
    /// Optional outer bound on draining. Workers still running when it
    /// elapses are aborted and their deliveries left for broker redelivery.
    pub drain_timeout_secs: Option<u64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            read_concurrency: DEFAULT_READ_CONCURRENCY,
            prefetch: 0,
            save_timeout_secs: DEFAULT_SAVE_TIMEOUT_SECS,
            drain_timeout_secs: None,
        }
    }
}

impl IngestConfig {
    /// Resolved worker count.
    pub fn concurrency(&self) -> usize {
        if self.read_concurrency <= 0 {
            DEFAULT_READ_CONCURRENCY as usize
        } else {
            self.read_concurrency as usize
        }
    }

    /// Resolved prefetch window, clamped to what AMQP can express.
    pub fn prefetch(&self) -> u16 {
        let n = if self.prefetch <= 0 {
            self.concurrency() as i64
        } else {
            self.prefetch
        };
        n.min(u16::MAX as i64) as u16
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_secs(self.save_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}
