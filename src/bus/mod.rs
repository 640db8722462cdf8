//! Event bus.
//!
//! This module contains:
//! - `BusPublisher` trait: hands marshalled messages to the broker
//! - `EventHandler` trait: processes events received by a `BusConsumer`
//! - `EventMarshaler`: wire envelope for `EventDescriptor`s
//! - Bus configuration types
//! - Implementations: AMQP (RabbitMQ), in-process channel, mock

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::events::EventDescriptor;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod consumer;
pub mod mock;
pub mod outbox;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConsumer, AmqpPublisher};
pub use channel::ChannelBus;
pub use consumer::{BusConsumer, EventPattern};
pub use mock::MockPublisher;
pub use outbox::{OutboxState, PublisherTemplate, TransactionalPublisher};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One message as handed to or received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub routing_key: String,
    /// Broker-level headers, used by headers exchanges for routing.
    pub headers: Map<String, Value>,
    /// JSON body.
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Value of the `name` header.
    pub fn name(&self) -> Option<&str> {
        self.headers.get("name").and_then(Value::as_str)
    }
}

/// Interface for delivering messages to the broker.
///
/// Implementations:
/// - `AmqpPublisher`: RabbitMQ via AMQP
/// - `ChannelBus`: in-process broadcast
/// - `MockPublisher`: in-memory recorder for testing
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish one message. Returns once the broker accepted it.
    async fn publish(&self, message: BusMessage) -> Result<()>;
}

/// Decoded event as seen by consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub name: String,
    pub routing_key: String,
    pub headers: Map<String, Value>,
    pub data: Value,
}

/// Handler for processing events from the bus.
pub trait EventHandler: Send + Sync {
    /// Process one event.
    fn handle(&self, event: Arc<InboundEvent>) -> BoxFuture<'static, Result<()>>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<InboundEvent>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, event: Arc<InboundEvent>) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.0)(event))
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<InboundEvent>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ============================================================================
// Marshalling
// ============================================================================

/// Builds the wire envelope for events published by this service.
#[derive(Debug, Clone)]
pub struct EventMarshaler {
    origin_uuid: String,
}

impl EventMarshaler {
    pub fn new(origin_uuid: impl Into<String>) -> Self {
        Self {
            origin_uuid: origin_uuid.into(),
        }
    }

    pub fn origin_uuid(&self) -> &str {
        &self.origin_uuid
    }

    /// Marshal `event` into a broker message.
    ///
    /// Headers are layered: `extra_headers`, then the event's scope headers,
    /// then the envelope fields, later layers winning. The payload is the
    /// header map plus `data`.
    pub fn marshal(
        &self,
        event: &EventDescriptor,
        extra_headers: &Map<String, Value>,
    ) -> Result<BusMessage> {
        let mut headers = extra_headers.clone();
        for (key, value) in event.headers() {
            headers.insert(key.clone(), value.clone());
        }
        headers.insert("required_access".into(), event.required_access().into());
        headers.insert("required_acl".into(), event.required_acl().into());
        headers.insert("name".into(), event.name().into());
        headers.insert("origin_uuid".into(), self.origin_uuid.clone().into());
        headers.insert("timestamp".into(), chrono::Utc::now().to_rfc3339().into());

        let mut body = headers.clone();
        body.insert("data".into(), event.marshal().clone());

        Ok(BusMessage {
            routing_key: event.routing_key().to_string(),
            headers,
            payload: serde_json::to_vec(&Value::Object(body))?,
        })
    }

    /// Decode a received message.
    ///
    /// Broker headers take precedence; when the transport carried none the
    /// envelope fields are recovered from the payload.
    pub fn unmarshal(message: &BusMessage) -> Result<InboundEvent> {
        let body: Value = serde_json::from_slice(&message.payload)?;
        let Value::Object(mut body) = body else {
            return Err(BusError::Decode("payload is not a JSON object".to_string()));
        };
        let data = body.remove("data").unwrap_or_else(|| Value::Object(Map::new()));
        let headers = if message.headers.is_empty() {
            body
        } else {
            message.headers.clone()
        };
        let name = headers
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BusError::Decode("missing 'name' header".to_string()))?
            .to_string();

        Ok(InboundEvent {
            name,
            routing_key: message.routing_key.clone(),
            headers,
            data,
        })
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Bus transport discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    /// AMQP/RabbitMQ messaging.
    #[default]
    Amqp,
    /// In-process broadcast channel (standalone runs, tests).
    Channel,
}

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Transport to use.
    #[serde(rename = "type")]
    pub bus_type: BusType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Exchange events are published to.
    pub exchange_name: String,
    /// Exchange kind: `headers` or `topic`.
    pub exchange_type: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_type: BusType::default(),
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            exchange_name: "accent-headers".to_string(),
            exchange_type: "headers".to_string(),
        }
    }
}

impl BusConfig {
    /// AMQP connection URL.
    pub fn url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2f",
            self.username, self.password, self.host, self.port
        )
    }

    /// Log the bus configuration without credentials.
    pub fn log_summary(&self) {
        info!(
            bus_type = ?self.bus_type,
            host = %self.host,
            port = self.port,
            exchange = %self.exchange_name,
            exchange_type = %self.exchange_type,
            "Bus configuration"
        );
    }
}
