//! Mock AJAM transport for testing.
//!
//! Replays queued responses in order and records every call.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AjamError, AjamTransport, Result};
use crate::ami::codec::ActionArgs;

/// Recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub action: String,
    pub params: Vec<(String, String)>,
}

/// Mock transport that serves canned bodies.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<String>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response body.
    pub fn with_response(self, body: impl Into<String>) -> Self {
        self.push_response(body);
        self
    }

    pub fn push_response(&self, body: impl Into<String>) {
        self.lock_responses().push_back(Ok(body.into()));
    }

    pub fn push_error(&self, error: AjamError) {
        self.lock_responses().push_back(Err(error));
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next(&self, action: &str, args: &ActionArgs) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                action: action.to_string(),
                params: crate::ami::codec::build_params(action, args),
            });
        self.lock_responses()
            .pop_front()
            .unwrap_or_else(|| {
                Err(AjamError::Unreachable {
                    url: "mock://rawman".to_string(),
                    cause: "no response queued".to_string(),
                })
            })
    }
}

#[async_trait]
impl AjamTransport for MockTransport {
    async fn get(&self, action: &str, args: &ActionArgs) -> Result<String> {
        self.next(action, args)
    }

    fn get_blocking(&self, action: &str, args: &ActionArgs) -> Result<String> {
        self.next(action, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_replays_in_order() {
        let mock = MockTransport::new()
            .with_response("Response: Success\r\n\r\n")
            .with_response("Response: Error\r\n\r\n");

        let first = mock.get("Ping", &ActionArgs::new()).await.unwrap();
        let second = mock.get("Ping", &ActionArgs::new()).await.unwrap();

        assert!(first.contains("Success"));
        assert!(second.contains("Error"));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_empty_queue_is_unreachable() {
        let mock = MockTransport::new();
        let err = mock.get("Ping", &ActionArgs::new()).await.unwrap_err();
        assert!(matches!(err, AjamError::Unreachable { .. }));
    }

    #[test]
    fn test_mock_records_params() {
        let mock = MockTransport::new().with_response("");
        let args = ActionArgs::new().with("Family", "cidname");
        mock.get_blocking("DBGet", &args).unwrap();

        let calls = mock.calls();
        assert_eq!(calls[0].action, "DBGet");
        assert!(calls[0]
            .params
            .contains(&("Family".to_string(), "cidname".to_string())));
    }
}
