//! Bus consumer: routes received messages to registered handlers.
//!
//! Transports (`AmqpConsumer`, `ChannelBus`) own the receive loop and hand
//! every message to [`BusConsumer::deliver`]. A failing, panicking or slow
//! handler is logged and skipped; it never stops the loop.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, warn, Instrument};

use super::{BusMessage, EventHandler, EventMarshaler, InboundEvent};
use crate::health::StatusProvider;

/// Default upper bound on one handler invocation.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix selecting routing-key matching in a registration pattern.
pub const ROUTING_KEY_PREFIX: &str = "rk:";

/// Which events a registration receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    /// Every event.
    All,
    /// Events whose `name` equals this.
    Name(String),
    /// Events whose routing key matches this topic pattern.
    RoutingKey(String),
}

impl EventPattern {
    /// Parse `*`, `rk:<topic pattern>` or an exact event name.
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            EventPattern::All
        } else if let Some(topic) = pattern.strip_prefix(ROUTING_KEY_PREFIX) {
            EventPattern::RoutingKey(topic.to_string())
        } else {
            EventPattern::Name(pattern.to_string())
        }
    }

    pub fn matches(&self, event: &InboundEvent) -> bool {
        match self {
            EventPattern::All => true,
            EventPattern::Name(name) => *name == event.name,
            EventPattern::RoutingKey(topic) => topic_matches(topic, &event.routing_key),
        }
    }
}

/// AMQP topic matching: `*` is exactly one segment, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    segments_match(&pattern, &key)
}

fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| segments_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && segments_match(rest, &key[1..]),
        Some((segment, rest)) => {
            key.first().is_some_and(|k| k == segment) && segments_match(rest, &key[1..])
        }
    }
}

struct Registration {
    pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
}

/// Handler registry plus the connection flag maintained by the transport loop.
pub struct BusConsumer {
    registrations: RwLock<Vec<Registration>>,
    connected: AtomicBool,
    handler_timeout: Duration,
}

impl Default for BusConsumer {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLER_TIMEOUT)
    }
}

impl BusConsumer {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            connected: AtomicBool::new(false),
            handler_timeout,
        }
    }

    /// Register `handler` for events matching `pattern`.
    pub async fn register(&self, pattern: &str, handler: Arc<dyn EventHandler>) {
        let pattern = EventPattern::parse(pattern);
        let count = {
            let mut registrations = self.registrations.write().await;
            registrations.push(Registration {
                pattern: pattern.clone(),
                handler,
            });
            registrations.len()
        };
        debug!(pattern = ?pattern, handler_count = count, "Handler registered");
    }

    /// Patterns registered so far, in registration order.
    pub async fn patterns(&self) -> Vec<EventPattern> {
        self.registrations
            .read()
            .await
            .iter()
            .map(|r| r.pattern.clone())
            .collect()
    }

    /// Whether the transport currently holds a live subscription.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Decode `message` and run every matching handler.
    ///
    /// Returns the number of handlers that completed successfully. Malformed
    /// messages are logged and yield zero.
    pub async fn deliver(&self, message: &BusMessage) -> usize {
        let event = match EventMarshaler::unmarshal(message) {
            Ok(event) => Arc::new(event),
            Err(e) => {
                warn!(routing_key = %message.routing_key, error = %e, "Dropping undecodable message");
                return 0;
            }
        };

        let span = tracing::info_span!("bus.consume", event = %event.name, routing_key = %event.routing_key);
        self.dispatch(event).instrument(span).await
    }

    async fn dispatch(&self, event: Arc<InboundEvent>) -> usize {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .registrations
            .read()
            .await
            .iter()
            .filter(|r| r.pattern.matches(&event))
            .map(|r| Arc::clone(&r.handler))
            .collect();

        if handlers.is_empty() {
            debug!("No handler registered for event");
            return 0;
        }

        let mut succeeded = 0;
        for handler in handlers {
            if self.invoke(handler, Arc::clone(&event)).await {
                succeeded += 1;
            }
        }
        succeeded
    }

    async fn invoke(&self, handler: Arc<dyn EventHandler>, event: Arc<InboundEvent>) -> bool {
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(future) => future,
            Err(_) => {
                error!("Handler panicked");
                return false;
            }
        };

        match tokio::time::timeout(self.handler_timeout, AssertUnwindSafe(future).catch_unwind())
            .await
        {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                error!(error = %e, "Handler failed");
                false
            }
            Ok(Err(_)) => {
                error!("Handler panicked");
                false
            }
            Err(_) => {
                error!(timeout_ms = self.handler_timeout.as_millis() as u64, "Handler timed out");
                false
            }
        }
    }
}

impl StatusProvider for BusConsumer {
    fn provide_status(&self) -> (String, Value) {
        let status = if self.connected() { "ok" } else { "fail" };
        ("bus_consumer".to_string(), json!({ "status": status }))
    }
}
