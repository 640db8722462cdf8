//! Transactional outbox for event delivery.
//!
//! A `TransactionalPublisher` couples event delivery to one unit of work:
//!
//! 1. `queue_event` while the work is in progress
//! 2. `flush` after the work committed, publishing every entry in order
//! 3. `rollback` if the work was abandoned, discarding every entry
//!
//! An entry leaves the queue only once the broker accepted it. When a publish
//! fails mid-flush the failed entry and everything behind it stay queued, so
//! a later `flush` resumes where the previous one stopped.
//!
//! The queue lives in memory. Events are not persisted; a process crash
//! between commit and flush loses them.
//!
//! # Usage
//!
//! ```ignore
//! let template = PublisherTemplate::capture(publisher, EventMarshaler::new(uuid));
//!
//! let mut uow = template.unit_of_work();
//! uow.queue_event(event, None);
//! // ... commit ...
//! uow.flush().await?;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::{BusPublisher, EventMarshaler, Result};
use crate::events::EventDescriptor;

/// Observable state of a [`TransactionalPublisher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    /// Nothing queued.
    Idle,
    /// At least one entry awaits `flush` or `rollback`.
    Queuing,
}

/// One queued event.
#[derive(Debug, Clone)]
struct OutboxEntry {
    event: EventDescriptor,
    extra_headers: Map<String, Value>,
}

/// Per-unit-of-work event queue.
///
/// Owned by exactly one unit of work; every mutating call takes `&mut self`.
pub struct TransactionalPublisher {
    publisher: Arc<dyn BusPublisher>,
    marshaler: EventMarshaler,
    queue: VecDeque<OutboxEntry>,
}

impl TransactionalPublisher {
    pub fn new(publisher: Arc<dyn BusPublisher>, marshaler: EventMarshaler) -> Self {
        Self {
            publisher,
            marshaler,
            queue: VecDeque::new(),
        }
    }

    /// Queue `event` for the next flush.
    pub fn queue_event(&mut self, event: EventDescriptor, extra_headers: Option<Map<String, Value>>) {
        debug!(
            event = %event.name(),
            routing_key = %event.routing_key(),
            pending = self.queue.len() + 1,
            "Queued event"
        );
        self.queue.push_back(OutboxEntry {
            event,
            extra_headers: extra_headers.unwrap_or_default(),
        });
    }

    /// Publish every queued entry in FIFO order.
    ///
    /// Returns the number of entries published. On error the failed entry and
    /// everything after it remain queued.
    pub async fn flush(&mut self) -> Result<usize> {
        let mut published = 0;
        while let Some(entry) = self.queue.front() {
            let message = self.marshaler.marshal(&entry.event, &entry.extra_headers)?;
            if let Err(e) = self.publisher.publish(message).await {
                error!(
                    event = %entry.event.name(),
                    remaining = self.queue.len(),
                    error = %e,
                    "Flush interrupted, entries kept for retry"
                );
                return Err(e);
            }
            self.queue.pop_front();
            published += 1;
        }
        if published > 0 {
            debug!(published, "Flushed outbox");
        }
        Ok(published)
    }

    /// Discard every queued entry. Returns how many were dropped.
    pub fn rollback(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        if dropped > 0 {
            debug!(dropped, "Rolled back outbox");
        }
        dropped
    }

    pub fn state(&self) -> OutboxState {
        if self.queue.is_empty() {
            OutboxState::Idle
        } else {
            OutboxState::Queuing
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Names of the queued events, in flush order.
    pub fn pending_names(&self) -> Vec<&str> {
        self.queue.iter().map(|e| e.event.name()).collect()
    }
}

impl Drop for TransactionalPublisher {
    fn drop(&mut self) {
        if !self.queue.is_empty() {
            warn!(
                discarded = self.queue.len(),
                "Publisher dropped with unflushed events"
            );
        }
    }
}

/// Snapshot of the configuration every unit of work publishes with.
///
/// Captured once at startup; `unit_of_work` hands out publishers that share
/// the broker connection and origin uuid but own separate queues.
#[derive(Clone)]
pub struct PublisherTemplate {
    publisher: Arc<dyn BusPublisher>,
    marshaler: EventMarshaler,
}

impl PublisherTemplate {
    pub fn capture(publisher: Arc<dyn BusPublisher>, marshaler: EventMarshaler) -> Self {
        Self {
            publisher,
            marshaler,
        }
    }

    /// Fresh publisher with an empty queue.
    pub fn unit_of_work(&self) -> TransactionalPublisher {
        TransactionalPublisher::new(Arc::clone(&self.publisher), self.marshaler.clone())
    }

    pub fn origin_uuid(&self) -> &str {
        self.marshaler.origin_uuid()
    }
}
