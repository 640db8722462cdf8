//! HTTP implementation of [`AjamTransport`].

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{AjamConfig, AjamError, AjamTransport, Result};
use crate::ami::codec::{build_params, split_blocks, ActionArgs};
use crate::utils::retry::is_retryable;

/// Outcome of one login attempt that did not succeed.
enum LoginFailure {
    /// Network-level failure; may be retried.
    Transport(AjamError),
    /// Asterisk answered and refused the credentials.
    Rejected(AjamError),
}

/// AJAM client running one session per call.
#[derive(Debug, Clone)]
pub struct AjamClient {
    config: AjamConfig,
    base_url: String,
    timeout: Duration,
}

impl AjamClient {
    pub fn new(config: AjamConfig) -> Self {
        let base_url = config.base_url();
        let timeout = Duration::from_millis(config.timeout_ms);
        info!(url = %base_url, timeout_ms = config.timeout_ms, "AJAM client configured");
        Self {
            config,
            base_url,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unreachable(&self, cause: impl Display) -> AjamError {
        AjamError::Unreachable {
            url: self.base_url.clone(),
            cause: cause.to_string(),
        }
    }

    fn login_params(&self) -> [(&str, &str); 3] {
        [
            ("action", "login"),
            ("username", self.config.username.as_str()),
            ("secret", self.config.password.as_str()),
        ]
    }

    /// Inspect a login reply; Asterisk answers bad credentials with 200 and
    /// `Response: Error`.
    fn check_login_body(&self, body: &str) -> std::result::Result<(), LoginFailure> {
        let rejected = split_blocks(body.as_bytes())
            .into_iter()
            .find(|block| block.is_action_result())
            .filter(|block| {
                block
                    .response()
                    .is_some_and(|r| r.eq_ignore_ascii_case("Error"))
            });
        match rejected {
            Some(block) => Err(LoginFailure::Rejected(self.unreachable(format!(
                "login rejected: {}",
                block.get("Message").unwrap_or("no reason given")
            )))),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // async
    // ------------------------------------------------------------------------

    fn async_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.config.https && !self.config.verify_certificate)
            .build()
            .map_err(|e| self.unreachable(e))
    }

    async fn login_once(&self, client: &reqwest::Client) -> std::result::Result<(), LoginFailure> {
        let response = client
            .get(&self.base_url)
            .query(&self.login_params())
            .send()
            .await
            .map_err(|e| LoginFailure::Transport(self.unreachable(e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoginFailure::Transport(
                self.unreachable(format!("login returned HTTP {}", status.as_u16())),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| LoginFailure::Transport(self.unreachable(e)))?;
        self.check_login_body(&body)
    }

    async fn login(&self, client: &reqwest::Client) -> Result<()> {
        let retry = &self.config.login_retry;
        let mut attempt = 0;
        loop {
            match self.login_once(client).await {
                Ok(()) => return Ok(()),
                Err(LoginFailure::Rejected(e)) => return Err(e),
                Err(LoginFailure::Transport(e)) if is_retryable(&e) && retry.should_retry(attempt) => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = retry.max_retries,
                        error = %e,
                        "AJAM login failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(LoginFailure::Transport(e)) => return Err(e),
            }
        }
    }

    async fn run_action(
        &self,
        client: &reqwest::Client,
        params: &[(String, String)],
    ) -> Result<String> {
        let response = client
            .get(&self.base_url)
            .query(params)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AjamError::HttpStatus {
                url: self.base_url.clone(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|e| self.unreachable(e))
    }

    // ------------------------------------------------------------------------
    // blocking
    // ------------------------------------------------------------------------

    fn blocking_client(&self) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.config.https && !self.config.verify_certificate)
            .build()
            .map_err(|e| self.unreachable(e))
    }

    fn login_once_blocking(
        &self,
        client: &reqwest::blocking::Client,
    ) -> std::result::Result<(), LoginFailure> {
        let response = client
            .get(&self.base_url)
            .query(&self.login_params())
            .send()
            .map_err(|e| LoginFailure::Transport(self.unreachable(e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoginFailure::Transport(
                self.unreachable(format!("login returned HTTP {}", status.as_u16())),
            ));
        }
        let body = response
            .text()
            .map_err(|e| LoginFailure::Transport(self.unreachable(e)))?;
        self.check_login_body(&body)
    }

    fn login_blocking(&self, client: &reqwest::blocking::Client) -> Result<()> {
        let retry = &self.config.login_retry;
        let mut attempt = 0;
        loop {
            match self.login_once_blocking(client) {
                Ok(()) => return Ok(()),
                Err(LoginFailure::Rejected(e)) => return Err(e),
                Err(LoginFailure::Transport(e)) if is_retryable(&e) && retry.should_retry(attempt) => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = retry.max_retries,
                        error = %e,
                        "AJAM login failed, retrying in {:?}",
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(LoginFailure::Transport(e)) => return Err(e),
            }
        }
    }

    fn run_action_blocking(
        &self,
        client: &reqwest::blocking::Client,
        params: &[(String, String)],
    ) -> Result<String> {
        let response = client
            .get(&self.base_url)
            .query(params)
            .send()
            .map_err(|e| self.unreachable(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AjamError::HttpStatus {
                url: self.base_url.clone(),
                status: status.as_u16(),
            });
        }
        response.text().map_err(|e| self.unreachable(e))
    }
}

#[async_trait]
impl AjamTransport for AjamClient {
    async fn get(&self, action: &str, args: &ActionArgs) -> Result<String> {
        let params = build_params(action, args);
        let client = self.async_client()?;

        self.login(&client).await?;
        let session = AjamSession::new(client.clone(), self.base_url.clone());

        debug!(action = %action, "Sending AJAM action");
        let result = self.run_action(&client, &params).await;
        session.logoff().await;
        result
    }

    fn get_blocking(&self, action: &str, args: &ActionArgs) -> Result<String> {
        let params = build_params(action, args);
        let client = self.blocking_client()?;

        self.login_blocking(&client)?;
        let session = BlockingSession::new(client.clone(), self.base_url.clone());

        debug!(action = %action, "Sending AJAM action (blocking)");
        let result = self.run_action_blocking(&client, &params);
        session.logoff();
        result
    }
}

// ============================================================================
// Session guards
// ============================================================================

/// Logged-in async session. Dropping it without `logoff` schedules a
/// best-effort logoff on the current runtime.
struct AjamSession {
    client: reqwest::Client,
    url: String,
    open: bool,
}

impl AjamSession {
    fn new(client: reqwest::Client, url: String) -> Self {
        Self {
            client,
            url,
            open: true,
        }
    }

    async fn logoff(mut self) {
        self.open = false;
        if let Err(e) = send_logoff(&self.client, &self.url).await {
            debug!(error = %e, "AJAM logoff failed");
        }
    }
}

async fn send_logoff(client: &reqwest::Client, url: &str) -> reqwest::Result<()> {
    client
        .get(url)
        .query(&[("action", "logoff")])
        .send()
        .await
        .map(|_| ())
}

impl Drop for AjamSession {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let url = std::mem::take(&mut self.url);
                handle.spawn(async move {
                    if let Err(e) = send_logoff(&client, &url).await {
                        debug!(error = %e, "Deferred AJAM logoff failed");
                    }
                });
            }
            Err(_) => warn!("AJAM session dropped outside a runtime, logoff skipped"),
        }
    }
}

/// Logged-in blocking session. Dropping it without `logoff` logs off inline.
struct BlockingSession {
    client: reqwest::blocking::Client,
    url: String,
    open: bool,
}

impl BlockingSession {
    fn new(client: reqwest::blocking::Client, url: String) -> Self {
        Self {
            client,
            url,
            open: true,
        }
    }

    fn logoff(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self
            .client
            .get(&self.url)
            .query(&[("action", "logoff")])
            .send()
        {
            debug!(error = %e, "AJAM logoff failed");
        }
    }
}

impl Drop for BlockingSession {
    fn drop(&mut self) {
        self.close();
    }
}
