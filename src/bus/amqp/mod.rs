//! AMQP (RabbitMQ) bus implementation.
//!
//! Publishes to a `headers` exchange by default (`accent-headers`), so
//! consumers bind on the `name` header. A `topic` exchange is also supported;
//! consumers then bind on routing-key patterns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use serde_json::{Map, Number, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BusConfig, BusConsumer, BusError, BusMessage, BusPublisher, EventPattern, Result};

/// Consumer tag announced to the broker.
const CONSUMER_TAG: &str = "ami-gateway-consumer";

fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type {
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

fn create_pool(config: &BusConfig) -> Result<Pool> {
    let manager = Manager::new(config.url(), Default::default());
    Pool::builder(manager)
        .max_size(10)
        .build()
        .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))
}

async fn get_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        BusError::Connection(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
}

async fn declare_exchange(channel: &Channel, config: &BusConfig) -> Result<()> {
    channel
        .exchange_declare(
            &config.exchange_name,
            exchange_kind(&config.exchange_type),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))
}

// ============================================================================
// Header conversion
// ============================================================================

/// Convert JSON headers into an AMQP field table.
pub fn to_field_table(headers: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let amqp = match value {
            Value::Null => AMQPValue::Void,
            Value::Bool(b) => AMQPValue::Boolean(*b),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => AMQPValue::LongLongInt(i),
                (None, Some(f)) => AMQPValue::Double(f),
                (None, None) => AMQPValue::LongString(LongString::from(n.to_string())),
            },
            Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
            other => AMQPValue::LongString(LongString::from(other.to_string())),
        };
        table.insert(ShortString::from(key.clone()), amqp);
    }
    table
}

/// Convert an AMQP field table back into JSON headers.
///
/// Value kinds with no JSON counterpart are skipped.
pub fn from_field_table(table: &FieldTable) -> Map<String, Value> {
    let mut headers = Map::new();
    for (key, value) in table.inner() {
        let json = match value {
            AMQPValue::Boolean(b) => Value::Bool(*b),
            AMQPValue::ShortShortInt(i) => Value::from(*i),
            AMQPValue::ShortShortUInt(i) => Value::from(*i),
            AMQPValue::ShortInt(i) => Value::from(*i),
            AMQPValue::ShortUInt(i) => Value::from(*i),
            AMQPValue::LongInt(i) => Value::from(*i),
            AMQPValue::LongUInt(i) => Value::from(*i),
            AMQPValue::LongLongInt(i) => Value::from(*i),
            AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
            AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
            AMQPValue::LongString(s) => {
                Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            AMQPValue::Void => Value::Null,
            _ => continue,
        };
        headers.insert(key.as_str().to_string(), json);
    }
    headers
}

// ============================================================================
// Publisher
// ============================================================================

/// Publisher backed by a pooled RabbitMQ connection.
///
/// The pool is shared by every unit of work; each publish takes a fresh
/// channel so a broken connection is replaced transparently.
pub struct AmqpPublisher {
    pool: Pool,
    exchange: String,
}

impl AmqpPublisher {
    /// Connect and declare the configured exchange.
    pub async fn new(config: &BusConfig) -> Result<Self> {
        let pool = create_pool(config)?;

        // Verify connection
        let channel = get_channel(&pool).await?;
        declare_exchange(&channel, config).await?;

        info!(
            exchange = %config.exchange_name,
            exchange_type = %config.exchange_type,
            host = %config.host,
            "Connected to AMQP"
        );

        Ok(Self {
            pool,
            exchange: config.exchange_name.clone(),
        })
    }
}

#[async_trait]
impl BusPublisher for AmqpPublisher {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(routing_key = %message.routing_key))]
    async fn publish(&self, message: BusMessage) -> Result<()> {
        const MAX_RETRIES: usize = 5;

        let headers = to_field_table(&message.headers);

        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Get fresh channel for each attempt (handles reconnection)
            let channel = match get_channel(&self.pool).await {
                Ok(ch) => ch,
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Failed to get channel, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_content_encoding("utf-8".into())
                .with_delivery_mode(2) // persistent
                .with_headers(headers.clone());

            match channel
                .basic_publish(
                    &self.exchange,
                    &message.routing_key,
                    BasicPublishOptions::default(),
                    &message.payload,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(
                            exchange = %self.exchange,
                            routing_key = %message.routing_key,
                            event = ?message.name(),
                            "Published event"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        error!(
                            attempt = attempt + 1,
                            max_retries = MAX_RETRIES,
                            error = %e,
                            "Publish confirmation failed, retrying..."
                        );
                        last_error = Some(BusError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(BusError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("Max retries exceeded".to_string())))
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// One queue binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub routing_key: String,
    pub arguments: Map<String, Value>,
}

/// Compute the queue bindings needed to receive every registered pattern.
///
/// On a headers exchange event names bind as `{x-match: all, name: ..}`;
/// `*` and routing-key patterns need a catch-all binding and are filtered by
/// the consumer. On a topic exchange routing-key patterns bind directly and
/// names need `#`.
pub fn bindings_for(exchange_type: &str, patterns: &[EventPattern]) -> Vec<Binding> {
    let mut bindings: Vec<Binding> = Vec::new();
    let mut push = |binding: Binding| {
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
    };

    for pattern in patterns {
        if exchange_type == "headers" {
            let mut arguments = Map::new();
            arguments.insert("x-match".to_string(), Value::from("all"));
            if let EventPattern::Name(name) = pattern {
                arguments.insert("name".to_string(), Value::from(name.as_str()));
            }
            push(Binding {
                routing_key: String::new(),
                arguments,
            });
        } else {
            let routing_key = match pattern {
                EventPattern::RoutingKey(topic) => topic.clone(),
                EventPattern::All | EventPattern::Name(_) => "#".to_string(),
            };
            push(Binding {
                routing_key,
                arguments: Map::new(),
            });
        }
    }
    bindings
}

/// Receive loop feeding a [`BusConsumer`] from RabbitMQ.
pub struct AmqpConsumer {
    pool: Pool,
    config: BusConfig,
    queue: String,
}

impl AmqpConsumer {
    /// Create a consumer. An empty `queue` asks the broker for an exclusive
    /// server-named queue.
    pub fn new(config: &BusConfig, queue: impl Into<String>) -> Result<Self> {
        Ok(Self {
            pool: create_pool(config)?,
            config: config.clone(),
            queue: queue.into(),
        })
    }

    /// Spawn the receive loop. Register handlers on `consumer` first; the
    /// bindings are computed from its patterns at each (re)connect.
    pub fn start(self, consumer: Arc<BusConsumer>) -> JoinHandle<()> {
        tokio::spawn(async move { self.consume_with_reconnect(consumer).await })
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn consume_with_reconnect(self, consumer: Arc<BusConsumer>) {
        use futures::StreamExt;

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            let patterns = consumer.patterns().await;
            match self.setup_consumer(&patterns).await {
                Ok(mut stream) => {
                    consumer.set_connected(true);
                    info!(queue = %self.queue, "Consumer connected, processing messages");
                    // Reset backoff on successful connection
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = stream.next().await {
                        match delivery {
                            Ok(delivery) => Self::process_delivery(delivery, &consumer).await,
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    consumer.set_connected(false);
                    info!(queue = %self.queue, "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    consumer.set_connected(false);
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %self.queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            // Brief pause before reconnecting after stream end (not error)
            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    /// Set up channel, exchange, queue and bindings.
    async fn setup_consumer(&self, patterns: &[EventPattern]) -> Result<lapin::Consumer> {
        let channel = get_channel(&self.pool).await?;
        declare_exchange(&channel, &self.config).await?;

        let options = if self.queue.is_empty() {
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            }
        } else {
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            }
        };
        let queue = channel
            .queue_declare(&self.queue, options, FieldTable::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        let queue_name = queue.name().as_str().to_string();

        let bindings = bindings_for(&self.config.exchange_type, patterns);
        if bindings.is_empty() {
            warn!(queue = %queue_name, "No handlers registered, queue has no bindings");
        }
        for binding in &bindings {
            channel
                .queue_bind(
                    &queue_name,
                    &self.config.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    to_field_table(&binding.arguments),
                )
                .await
                .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;
            debug!(
                queue = %queue_name,
                routing_key = %binding.routing_key,
                arguments = ?binding.arguments,
                "Bound queue to exchange"
            );
        }

        channel
            .basic_consume(
                &queue_name,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    /// Hand one delivery to the consumer, then ack it.
    ///
    /// Handler failures are logged by the consumer and still acked; nothing
    /// is redelivered.
    async fn process_delivery(delivery: lapin::message::Delivery, consumer: &BusConsumer) {
        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default();
        let message = BusMessage {
            routing_key: delivery.routing_key.as_str().to_string(),
            headers,
            payload: delivery.data.clone(),
        };

        consumer.deliver(&message).await;

        if let Err(e) = delivery.ack(Default::default()).await {
            error!(error = %e, "Failed to ack message");
        }
    }
}
