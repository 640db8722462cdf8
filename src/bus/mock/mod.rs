//! Mock publisher implementation for testing.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, BusMessage, BusPublisher, Result};

/// Mock publisher that records every message in memory.
#[derive(Default)]
pub struct MockPublisher {
    published: RwLock<Vec<BusMessage>>,
    fail_on_publish: RwLock<bool>,
    /// Fail every publish once this many messages were accepted.
    fail_after: RwLock<Option<usize>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_after(&self, accepted: Option<usize>) {
        *self.fail_after.write().await = accepted;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<BusMessage> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<BusMessage> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl BusPublisher for MockPublisher {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        let mut published = self.published.write().await;
        if let Some(limit) = *self.fail_after.read().await {
            if published.len() >= limit {
                return Err(BusError::Publish("Mock publish limit reached".to_string()));
            }
        }
        published.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn message(routing_key: &str) -> BusMessage {
        BusMessage {
            routing_key: routing_key.to_string(),
            headers: Map::new(),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_mock_publisher_records() {
        let publisher = MockPublisher::new();
        publisher.publish(message("a")).await.unwrap();
        publisher.publish(message("b")).await.unwrap();

        let keys: Vec<_> = publisher
            .published()
            .await
            .into_iter()
            .map(|m| m.routing_key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_mock_publisher_fail_on_publish() {
        let publisher = MockPublisher::new();
        publisher.set_fail_on_publish(true).await;

        assert!(publisher.publish(message("a")).await.is_err());
        assert_eq!(publisher.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_publisher_fail_after() {
        let publisher = MockPublisher::new();
        publisher.set_fail_after(Some(1)).await;

        assert!(publisher.publish(message("a")).await.is_ok());
        assert!(publisher.publish(message("b")).await.is_err());
        assert_eq!(publisher.take_published().await.len(), 1);
        assert_eq!(publisher.published_count().await, 0);
    }
}
