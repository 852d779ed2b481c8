//! Broker configuration types.

use serde::Deserialize;

/// Messaging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}

/// AMQP queue and consumer settings.
///
/// The queue is declared with exactly these flags, so they must agree with
/// any existing declaration on the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    pub queue_name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub consumer_tag: String,
    /// Extra queue arguments (`x-queue-type`, `x-message-ttl`, ...).
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            queue_name: "audit_events".to_string(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
            consumer_tag: "audit-ingest".to_string(),
            args: serde_json::Map::new(),
        }
    }
}
