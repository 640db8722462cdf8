//! AMI event relay.
//!
//! Keeps a TCP Manager Interface connection open, turns every event block
//! Asterisk emits into an `AMI_EVENT` descriptor and publishes each read's
//! batch through a fresh unit of work.

use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::block::{AmiBlock, Headers, HEADER_MESSAGE};
use super::codec::split_blocks;
use crate::bus::outbox::PublisherTemplate;
use crate::events::catalog::AMI_EVENT;
use crate::events::{EventDescriptor, EventError};

/// ActionID tagged on the relay's own login.
const LOGIN_ACTION_ID: &str = "ami-gateway-relay-login";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 4096;
/// Upper bound on buffered input that has not yet reached a block separator.
const MAX_PENDING: usize = 4 * 1024 * 1024;

/// TCP AMI endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmiConfig {
    /// Start the relay at all.
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Wait between a lost connection and the next attempt.
    pub reconnect_delay_ms: u64,
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 5038,
            username: String::new(),
            password: String::new(),
            reconnect_delay_ms: 5000,
        }
    }
}

impl AmiConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Why a relay session ended.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("AMI connection closed by peer")]
    Closed,

    #[error("AMI login rejected: {0}")]
    LoginRejected(String),

    #[error("AMI peer sent {0} bytes without a block separator")]
    Overflow(usize),
}

/// Republishes AMI events on the bus.
pub struct AmiRelay {
    config: AmiConfig,
    template: PublisherTemplate,
}

impl AmiRelay {
    pub fn new(config: AmiConfig, template: PublisherTemplate) -> Self {
        Self { config, template }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let address = self.config.address();
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        info!(address = %address, "Starting AMI event relay");

        loop {
            match self.session(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(address = %address, error = %e, "AMI relay disconnected, reconnecting in {:?}", delay);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                stop = wait_for_stop(&mut shutdown) => {
                    if stop {
                        break;
                    }
                }
            }
        }
        info!(address = %address, "AMI event relay stopped");
    }

    fn login_block(&self) -> AmiBlock {
        let headers: Headers = [
            ("Action", "Login"),
            ("ActionID", LOGIN_ACTION_ID),
            ("Username", self.config.username.as_str()),
            ("Secret", self.config.password.as_str()),
            ("Events", "on"),
        ]
        .into_iter()
        .collect();
        AmiBlock::new(headers)
    }

    /// One connection's lifetime. `Ok` means the relay was asked to stop.
    async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), RelayError> {
        let address = self.config.address();
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| RelayError::ConnectTimeout(address.clone()))??;
        info!(address = %address, "Connected to AMI");

        stream
            .write_all(self.login_block().to_wire().as_bytes())
            .await?;

        let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK * 2);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            tokio::select! {
                stop = wait_for_stop(shutdown) => {
                    if stop {
                        let logoff = AmiBlock::new([("Action", "Logoff")].into_iter().collect());
                        if let Err(e) = stream.write_all(logoff.to_wire().as_bytes()).await {
                            debug!(error = %e, "AMI logoff failed");
                        }
                        return Ok(());
                    }
                }
                read = stream.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Err(RelayError::Closed);
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                    let blocks = drain_blocks(&mut buffer, MAX_PENDING)?;
                    if !blocks.is_empty() {
                        self.handle_blocks(blocks).await?;
                    }
                }
            }
        }
    }

    /// Publish the event blocks of one read. Returns how many were published.
    async fn handle_blocks(&self, blocks: Vec<AmiBlock>) -> Result<usize, RelayError> {
        let mut unit = self.template.unit_of_work();
        for block in blocks {
            if block.action_id() == Some(LOGIN_ACTION_ID) {
                check_login(&block)?;
                continue;
            }
            if !block.is_event() {
                continue;
            }
            match event_descriptor(&block) {
                Ok(event) => unit.queue_event(event, None),
                Err(e) => warn!(error = %e, block = %block, "Skipping AMI event"),
            }
        }

        if unit.pending() == 0 {
            return Ok(0);
        }
        match unit.flush().await {
            Ok(published) => {
                debug!(published, "Relayed AMI events");
                Ok(published)
            }
            Err(e) => {
                let dropped = unit.rollback();
                error!(error = %e, dropped, "Failed to publish AMI events");
                Ok(0)
            }
        }
    }
}

fn check_login(block: &AmiBlock) -> Result<(), RelayError> {
    if block
        .response()
        .is_some_and(|r| r.eq_ignore_ascii_case("Error"))
    {
        let message = block.get(HEADER_MESSAGE).unwrap_or("no reason given");
        return Err(RelayError::LoginRejected(message.to_string()));
    }
    info!("Logged in to AMI");
    Ok(())
}

/// Wrap one AMI event block in an `AMI_EVENT` descriptor.
pub fn event_descriptor(block: &AmiBlock) -> Result<EventDescriptor, EventError> {
    let content = serde_json::to_value(&block.headers)
        .map_err(|e| EventError::Configuration(e.to_string()))?;
    EventDescriptor::builder(&AMI_EVENT).content(content).build()
}

/// Resolves to `true` once the relay should stop.
async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    match shutdown.changed().await {
        Ok(()) => *shutdown.borrow(),
        Err(_) => true,
    }
}

/// Remove and parse every complete block at the front of `buffer`.
///
/// Fails once the incomplete remainder exceeds `max_pending` bytes.
fn drain_blocks(buffer: &mut Vec<u8>, max_pending: usize) -> Result<Vec<AmiBlock>, RelayError> {
    let complete = complete_prefix_len(buffer);
    let blocks = if complete == 0 {
        Vec::new()
    } else {
        let blocks = split_blocks(&buffer[..complete]);
        buffer.drain(..complete);
        blocks
    };
    if buffer.len() > max_pending {
        return Err(RelayError::Overflow(buffer.len()));
    }
    Ok(blocks)
}

/// Length of the prefix of `buffer` that ends on a block separator.
fn complete_prefix_len(buffer: &[u8]) -> usize {
    let mut boundary = 0;
    let mut line_start = 0;
    for (i, byte) in buffer.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &buffer[line_start..i];
        if line.is_empty() || line == b"\r" {
            boundary = i + 1;
        }
        line_start = i + 1;
    }
    boundary
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;
    use crate::bus::mock::MockPublisher;
    use crate::bus::{BusPublisher, EventMarshaler};

    fn relay_for(port: u16, publisher: Arc<MockPublisher>) -> AmiRelay {
        let config = AmiConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port,
            username: "relay".to_string(),
            password: "secret".to_string(),
            reconnect_delay_ms: 50,
        };
        let publisher: Arc<dyn BusPublisher> = publisher;
        AmiRelay::new(
            config,
            PublisherTemplate::capture(publisher, EventMarshaler::new("test-origin")),
        )
    }

    async fn wait_for_published(publisher: &MockPublisher, count: usize) {
        for _ in 0..100 {
            if publisher.published_count().await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {count} published events");
    }

    async fn read_login(socket: &mut TcpStream) -> String {
        let mut received = Vec::new();
        let mut chunk = [0u8; 512];
        while complete_prefix_len(&received) == 0 {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "relay closed before logging in");
            received.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(received).unwrap()
    }

    #[test]
    fn test_complete_prefix_len() {
        assert_eq!(complete_prefix_len(b""), 0);
        assert_eq!(complete_prefix_len(b"Event: A\r\n"), 0);
        assert_eq!(complete_prefix_len(b"Event: A\r\n\r\n"), 12);
        assert_eq!(complete_prefix_len(b"Event: A\n\nEvent: B\n"), 10);
        assert_eq!(complete_prefix_len(b"Event: A\r\n\r\nEvent: B\r\n\r\n"), 24);
    }

    #[test]
    fn test_drain_blocks_keeps_partial_tail() {
        let mut buffer = b"Event: A\r\n\r\nEvent: B\r\nChan".to_vec();

        let blocks = drain_blocks(&mut buffer, 64).unwrap();

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].event_name(), Some("A"));
        assert_eq!(buffer, b"Event: B\r\nChan");
    }

    #[test]
    fn test_drain_blocks_rejects_unterminated_flood() {
        let mut buffer = b"Event: A\r\n".repeat(10);

        let err = drain_blocks(&mut buffer, 64).unwrap_err();

        assert!(matches!(err, RelayError::Overflow(100)));
    }

    #[test]
    fn test_event_descriptor_uses_event_name() {
        let block = AmiBlock::new(
            [("Event", "Newchannel"), ("Channel", "PJSIP/100-0001")]
                .into_iter()
                .collect(),
        );

        let event = event_descriptor(&block).unwrap();

        assert_eq!(event.name(), "Newchannel");
        assert_eq!(event.routing_key(), "ami.Newchannel");
        assert_eq!(event.marshal()["Channel"], "PJSIP/100-0001");
    }

    #[test]
    fn test_login_block_wire() {
        let relay = relay_for(5038, Arc::new(MockPublisher::new()));
        let wire = relay.login_block().to_wire();
        assert!(wire.starts_with("Action: Login\r\n"));
        assert!(wire.contains("Username: relay\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_relay_publishes_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let publisher = Arc::new(MockPublisher::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = relay_for(port, publisher.clone()).start(stop_rx);

        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(b"Asterisk Call Manager/5.0.1\r\n")
            .await
            .unwrap();
        let login = read_login(&mut socket).await;
        assert!(login.contains("Secret: secret"));

        socket
            .write_all(
                format!(
                    "Response: Success\r\nActionID: {LOGIN_ACTION_ID}\r\nMessage: Authentication accepted\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        // Second event split across writes.
        socket
            .write_all(b"Event: FullyBooted\r\nStatus: Fully Booted\r\n\r\nEvent: Hang")
            .await
            .unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        socket
            .write_all(b"up\r\nChannel: PJSIP/100-0001\r\nCause: 16\r\n\r\n")
            .await
            .unwrap();

        wait_for_published(&publisher, 2).await;
        let names: Vec<_> = publisher
            .published()
            .await
            .iter()
            .map(|m| m.name().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec!["FullyBooted", "Hangup"]);
        let published = publisher.published().await;
        assert_eq!(published[1].routing_key, "ami.Hangup");
        assert_eq!(published[1].headers["origin_uuid"], "test-origin");

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_reconnects_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let publisher = Arc::new(MockPublisher::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = relay_for(port, publisher.clone()).start(stop_rx);

        let (first, _) = listener.accept().await.unwrap();
        drop(first);

        let (mut second, _) = listener.accept().await.unwrap();
        read_login(&mut second).await;
        second
            .write_all(b"Event: Reload\r\nModule: manager\r\n\r\n")
            .await
            .unwrap();

        wait_for_published(&publisher, 1).await;
        assert_eq!(publisher.published().await[0].name(), Some("Reload"));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_drops_batch_when_bus_fails() {
        let publisher = Arc::new(MockPublisher::new());
        publisher.set_fail_on_publish(true).await;
        let relay = relay_for(5038, publisher.clone());

        let blocks = split_blocks(b"Event: A\r\n\r\nEvent: B\r\n\r\n");
        let published = relay.handle_blocks(blocks).await.unwrap();

        assert_eq!(published, 0);
        assert_eq!(publisher.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejected_login_ends_session() {
        let relay = relay_for(5038, Arc::new(MockPublisher::new()));
        let blocks = split_blocks(
            format!("Response: Error\r\nActionID: {LOGIN_ACTION_ID}\r\nMessage: Authentication failed\r\n\r\n")
                .as_bytes(),
        );

        let err = relay.handle_blocks(blocks).await.unwrap_err();

        assert!(matches!(err, RelayError::LoginRejected(m) if m == "Authentication failed"));
    }
}
