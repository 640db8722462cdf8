//! Action dispatcher.
//!
//! Turns an action name and arguments into a list of [`ActionResult`]s by
//! running one AJAM session and decoding the body with the AMI codec.

use std::cell::RefCell;
use std::sync::Arc;

use serde::ser::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::ajam::{AjamError, AjamTransport};
use crate::ami::block::{AmiBlock, Headers, HEADER_ACTION_ID, HEADER_MESSAGE, HEADER_RESPONSE};
use crate::ami::codec::{parse_buffer, parse_command_response, split_blocks, ActionArgs};

/// Actions that cannot be served through the generic action path.
pub const RESERVED_ACTIONS: &[&str] = &["queues", "command"];

/// Action used to run CLI commands.
pub const COMMAND_ACTION: &str = "Command";

const RESPONSE_ERROR: &str = "Error";

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors returned by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Action '{0}' is not supported through this endpoint")]
    Unsupported(String),

    #[error("AMI action failed: {message}")]
    Protocol { message: String },

    #[error(transparent)]
    Gateway(#[from] AjamError),
}

/// One decoded AMI result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Success {
        message: Option<String>,
        data: Headers,
    },
    Error {
        message: String,
    },
}

impl ActionResult {
    fn from_action_block(response: &str, block: AmiBlock) -> Self {
        let message = block.get(HEADER_MESSAGE).map(str::to_string);
        if response.eq_ignore_ascii_case(RESPONSE_ERROR) {
            return ActionResult::Error {
                message: message.unwrap_or_default(),
            };
        }
        ActionResult::Success {
            message,
            data: block
                .headers
                .without(&[HEADER_RESPONSE, HEADER_MESSAGE, HEADER_ACTION_ID]),
        }
    }

    fn from_event_block(block: AmiBlock) -> Self {
        ActionResult::Success {
            message: None,
            data: block.headers.without(&[HEADER_ACTION_ID]),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionResult::Success { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ActionResult::Success { message, .. } => message.as_deref(),
            ActionResult::Error { message } => Some(message),
        }
    }

    pub fn data(&self) -> Option<&Headers> {
        match self {
            ActionResult::Success { data, .. } => Some(data),
            ActionResult::Error { .. } => None,
        }
    }
}

#[derive(serde::Serialize)]
struct FlatResult<'a> {
    #[serde(rename = "Response")]
    response: &'a str,
    #[serde(rename = "Message", skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(flatten)]
    data: Option<&'a Headers>,
}

/// Serializes as `{"Response": .., "Message": .., <data>..}`.
impl Serialize for ActionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let flat = match self {
            ActionResult::Success { message, data } => FlatResult {
                response: "Success",
                message: message.as_deref(),
                data: Some(data),
            },
            ActionResult::Error { message } => FlatResult {
                response: RESPONSE_ERROR,
                message: Some(message),
                data: None,
            },
        };
        flat.serialize(serializer)
    }
}

/// Decode an AJAM body into results, failing on the first error result.
pub fn collect_results(body: &str) -> Result<Vec<ActionResult>> {
    let results = RefCell::new(Vec::new());
    parse_buffer(
        body.as_bytes(),
        |_, block| results.borrow_mut().push(ActionResult::from_event_block(block)),
        |response, _, block| {
            results
                .borrow_mut()
                .push(ActionResult::from_action_block(response, block))
        },
    );
    let results = results.into_inner();

    if let Some(ActionResult::Error { message }) =
        results.iter().find(|r| !r.is_success())
    {
        return Err(DispatchError::Protocol {
            message: message.clone(),
        });
    }
    Ok(results)
}

/// Extract command output, falling back to `Output` headers for servers that
/// answer `Command` with a plain `Response: Success` block.
fn collect_command_output(body: &str) -> Result<Vec<String>> {
    let lines = parse_command_response(body.as_bytes());
    if !lines.is_empty() {
        return Ok(lines);
    }

    let blocks = split_blocks(body.as_bytes());
    let Some(result) = blocks.iter().find(|b| b.is_action_result()) else {
        return Ok(Vec::new());
    };
    if result
        .response()
        .is_some_and(|r| r.eq_ignore_ascii_case(RESPONSE_ERROR))
    {
        return Err(DispatchError::Protocol {
            message: result.get(HEADER_MESSAGE).unwrap_or_default().to_string(),
        });
    }
    Ok(result
        .headers
        .get_all("Output")
        .map(str::to_string)
        .collect())
}

fn is_reserved(action: &str) -> bool {
    RESERVED_ACTIONS
        .iter()
        .any(|r| r.eq_ignore_ascii_case(action))
}

/// Runs AMI actions through an [`AjamTransport`].
#[derive(Clone)]
pub struct ActionDispatcher {
    transport: Arc<dyn AjamTransport>,
}

impl ActionDispatcher {
    pub fn new(transport: Arc<dyn AjamTransport>) -> Self {
        Self { transport }
    }

    fn check_action(action: &str) -> Result<()> {
        if is_reserved(action) {
            warn!(action = %action, "Rejected reserved action");
            return Err(DispatchError::Unsupported(action.to_string()));
        }
        Ok(())
    }

    /// Run `action` and return every result in arrival order.
    pub async fn dispatch(&self, action: &str, args: &ActionArgs) -> Result<Vec<ActionResult>> {
        Self::check_action(action)?;
        info!(action = %action, args = args.len(), "Dispatching AMI action");
        let body = self.transport.get(action, args).await?;
        let results = collect_results(&body)?;
        debug!(action = %action, results = results.len(), "AMI action completed");
        Ok(results)
    }

    /// Blocking variant of [`dispatch`](Self::dispatch).
    pub fn dispatch_blocking(&self, action: &str, args: &ActionArgs) -> Result<Vec<ActionResult>> {
        Self::check_action(action)?;
        info!(action = %action, args = args.len(), "Dispatching AMI action (blocking)");
        let body = self.transport.get_blocking(action, args)?;
        collect_results(&body)
    }

    /// Run a CLI command and return its output lines.
    pub async fn command(&self, command: &str) -> Result<Vec<String>> {
        info!(command = %command, "Running AMI command");
        let args = ActionArgs::new().with(COMMAND_ACTION, command);
        let body = self.transport.get(COMMAND_ACTION, &args).await?;
        collect_command_output(&body)
    }

    /// Blocking variant of [`command`](Self::command).
    pub fn command_blocking(&self, command: &str) -> Result<Vec<String>> {
        info!(command = %command, "Running AMI command (blocking)");
        let args = ActionArgs::new().with(COMMAND_ACTION, command);
        let body = self.transport.get_blocking(COMMAND_ACTION, &args)?;
        collect_command_output(&body)
    }
}
