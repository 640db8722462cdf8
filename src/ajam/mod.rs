//! AJAM session client.
//!
//! Asterisk exposes the Manager Interface over HTTP at `/rawman`. Every call
//! made here runs a complete, private session:
//!
//! ```text
//! GET {base}?action=login&username=..&secret=..
//! GET {base}?action={name}&{args}
//! GET {base}?action=logoff
//! ```
//!
//! Sessions are never reused. Each call builds a fresh client with its own
//! cookie store, so no state leaks between callers.

pub mod client;
pub mod mock;

pub use client::AjamClient;
pub use mock::MockTransport;

use async_trait::async_trait;
use serde::Deserialize;

use crate::ami::codec::ActionArgs;
use crate::utils::retry::RetryConfig;

/// Result type for AJAM calls.
pub type Result<T> = std::result::Result<T, AjamError>;

/// Errors raised by the AJAM transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AjamError {
    /// Network failure, timeout, TLS failure or rejected credentials.
    #[error("AJAM gateway unreachable at {url}: {cause}")]
    Unreachable { url: String, cause: String },

    /// The action request returned a non-2xx status.
    #[error("AJAM request to {url} failed with HTTP status {status}")]
    HttpStatus { url: String, status: u16 },
}

/// Runs one AMI action over AJAM and returns the raw response body.
///
/// Implementations:
/// - `AjamClient`: real HTTP sessions against Asterisk
/// - `MockTransport`: canned responses plus a call log for tests
#[async_trait]
pub trait AjamTransport: Send + Sync {
    async fn get(&self, action: &str, args: &ActionArgs) -> Result<String>;

    /// Blocking variant. Must not be called from within an async runtime.
    fn get_blocking(&self, action: &str, args: &ActionArgs) -> Result<String>;
}

/// AJAM endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AjamConfig {
    pub host: String,
    pub port: u16,
    pub https: bool,
    /// Verify the server certificate when `https` is set.
    pub verify_certificate: bool,
    pub username: String,
    pub password: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Backoff policy for the login step.
    pub login_retry: RetryConfig,
}

impl Default for AjamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5039,
            https: false,
            verify_certificate: true,
            username: String::new(),
            password: String::new(),
            timeout_ms: 5000,
            login_retry: RetryConfig::for_ajam_login(),
        }
    }
}

impl AjamConfig {
    /// `{http|https}://{host}:{port}/rawman`
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}:{}/rawman", scheme, self.host, self.port)
    }
}
