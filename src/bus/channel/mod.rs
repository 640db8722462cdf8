//! In-memory channel-based bus for standalone mode.
//!
//! Uses tokio broadcast channels for pub/sub within a single process.
//! Ideal for local development and testing without a broker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{BusConsumer, BusMessage, BusPublisher, Result};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// In-process bus using a tokio broadcast channel.
///
/// Every attached consumer sees every message; filtering happens in
/// [`BusConsumer`] against its registrations.
#[derive(Clone)]
pub struct ChannelBus {
    sender: broadcast::Sender<Arc<BusMessage>>,
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        info!("Channel bus initialized");
        Self { sender }
    }

    /// Number of attached consumers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Start feeding every published message to `consumer`.
    ///
    /// The consumer is marked connected as soon as its receiver exists, so
    /// messages published after this call returns are never missed.
    pub fn attach(&self, consumer: Arc<BusConsumer>) -> JoinHandle<()> {
        let mut receiver = self.sender.subscribe();
        consumer.set_connected(true);
        info!("Channel consumer started");

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        debug!(routing_key = %message.routing_key, "Received message via channel");
                        consumer.deliver(&message).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel consumer lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping consumer");
                        consumer.set_connected(false);
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl BusPublisher for ChannelBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(routing_key = %message.routing_key))]
    async fn publish(&self, message: BusMessage) -> Result<()> {
        let routing_key = message.routing_key.clone();

        // Send to channel (ignore error if no receivers)
        match self.sender.send(Arc::new(message)) {
            Ok(receiver_count) => {
                debug!(
                    routing_key = %routing_key,
                    receivers = receiver_count,
                    "Published message to channel"
                );
            }
            Err(_) => {
                debug!(routing_key = %routing_key, "Published message (no receivers)");
            }
        }
        Ok(())
    }
}
