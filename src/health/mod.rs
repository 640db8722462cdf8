//! Service status aggregation for `GET /status`.

use std::sync::Arc;

use serde_json::{Map, Value};

/// Contributes one named entry to the status report.
pub trait StatusProvider: Send + Sync {
    /// `(component, status)` pair, e.g. `("bus_consumer", {"status": "ok"})`.
    fn provide_status(&self) -> (String, Value);
}

/// Collects status from every registered provider.
#[derive(Default, Clone)]
pub struct StatusAggregator {
    providers: Vec<Arc<dyn StatusProvider>>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&mut self, provider: Arc<dyn StatusProvider>) {
        self.providers.push(provider);
    }

    /// Current status of every provider. Later providers win on name clashes.
    pub fn status(&self) -> Map<String, Value> {
        self.providers
            .iter()
            .map(|provider| provider.provide_status())
            .collect()
    }
}
