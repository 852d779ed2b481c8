//! AMQP (RabbitMQ) dispatcher.
//!
//! Owns one connection, one channel and one consumer. The queue is declared
//! with the configured flags and arguments, and `basic.qos` caps unacked
//! deliveries at the prefetch count. Any failure while setting this up is
//! returned to the caller; there is no reconnect loop.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable},
    Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{Delivery, DeliveryStream, Dispatcher, IngestError, IntakeGate, Result};
use crate::config::AmqpConfig;
use crate::utils::retry::redact_url;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Convert configured queue arguments into an AMQP field table.
fn field_table(args: &serde_json::Map<String, serde_json::Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        table.insert(key.clone().into(), amqp_value(value));
    }
    table
}

fn amqp_value(value: &serde_json::Value) -> AMQPValue {
    use serde_json::Value;

    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(key.clone().into(), amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

/// Dispatcher backed by a RabbitMQ queue.
pub struct AmqpDispatcher {
    connection: Connection,
    channel: Channel,
    consumer_tag: String,
    queue: String,
    stream: Arc<AmqpStream>,
}

impl AmqpDispatcher {
    /// Connect, declare the queue, set prefetch and start consuming.
    pub async fn connect(config: &AmqpConfig, prefetch: u16) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| IngestError::Connection(format!("{}: {}", redact_url(&config.url), e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| IngestError::Channel(e.to_string()))?;

        channel
            .queue_declare(
                &config.queue_name,
                QueueDeclareOptions {
                    passive: false,
                    durable: config.durable,
                    exclusive: config.exclusive,
                    auto_delete: config.auto_delete,
                    nowait: config.no_wait,
                },
                field_table(&config.args),
            )
            .await
            .map_err(|e| IngestError::QueueDeclare(format!("{}: {}", config.queue_name, e)))?;

        channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|e| IngestError::Qos(e.to_string()))?;

        let consumer = channel
            .basic_consume(
                &config.queue_name,
                &config.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| IngestError::Consume(e.to_string()))?;

        info!(
            url = %redact_url(&config.url),
            queue = %config.queue_name,
            prefetch,
            "Consuming from AMQP queue"
        );

        Ok(Self {
            connection,
            channel,
            consumer_tag: config.consumer_tag.clone(),
            queue: config.queue_name.clone(),
            stream: Arc::new(AmqpStream {
                consumer: Mutex::new(consumer),
                gate: IntakeGate::new(),
            }),
        })
    }
}

struct AmqpStream {
    consumer: Mutex<Consumer>,
    gate: IntakeGate,
}

#[async_trait]
impl DeliveryStream for AmqpStream {
    async fn next_delivery(&self) -> Option<Box<dyn Delivery>> {
        if !self.gate.is_open() {
            return None;
        }

        let mut consumer = self.consumer.lock().await;
        let next = tokio::select! {
            biased;
            _ = self.gate.closed() => return None,
            next = consumer.next() => next,
        };

        match next {
            Some(Ok(delivery)) => Some(Box::new(AmqpDelivery(delivery))),
            Some(Err(e)) => {
                error!(error = %e, "Consumer delivery error, ending intake");
                self.gate.close();
                None
            }
            None => {
                info!("Consumer stream ended");
                self.gate.close();
                None
            }
        }
    }
}

struct AmqpDelivery(lapin::message::Delivery);

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    fn tag(&self) -> u64 {
        self.0.delivery_tag
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| IngestError::Ack(e.to_string()))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|e| IngestError::Ack(e.to_string()))
    }
}

#[async_trait]
impl Dispatcher for AmqpDispatcher {
    fn deliveries(&self) -> Arc<dyn DeliveryStream> {
        self.stream.clone()
    }

    async fn stop_intake(&self) -> Result<()> {
        self.stream.gate.close();
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| IngestError::Consume(format!("cancel {}: {}", self.consumer_tag, e)))?;
        debug!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.stream.gate.close();
        let channel = self
            .channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| IngestError::Close(format!("channel: {}", e)));
        let connection = self
            .connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| IngestError::Close(format!("connection: {}", e)));

        info!(queue = %self.queue, "AMQP connection closed");
        channel.and(connection)
    }
}
