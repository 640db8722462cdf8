//! AMI wire codec.
//!
//! Pure functions over byte buffers. Nothing here performs I/O or keeps state
//! between calls, so the codec may be used from any number of tasks at once.

use serde_json::Value;
use tracing::debug;

use crate::ami::block::{AmiBlock, Headers, HEADER_ACTION_ID, HEADER_RESPONSE};

/// Terminates the body of a `Response: Follows` block.
pub const COMMAND_END: &str = "--END COMMAND--";

/// `Response` value announcing raw command output.
pub const RESPONSE_FOLLOWS: &str = "Follows";

/// Headers that frame a `Response: Follows` body and are not part of it.
const FOLLOWS_FRAMING: &[&str] = &["Privilege", HEADER_ACTION_ID];

// ============================================================================
// Action arguments
// ============================================================================

/// Value of a single action argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Single(String),
    /// Expands into one repeated key per element, in order.
    Multiple(Vec<String>),
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Single(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Single(value)
    }
}

impl From<Vec<String>> for ArgValue {
    fn from(values: Vec<String>) -> Self {
        ArgValue::Multiple(values)
    }
}

/// Ordered action arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionArgs {
    entries: Vec<(String, ArgValue)>,
}

impl ActionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Convert a JSON object body into arguments.
    ///
    /// Scalars are stringified, arrays become [`ArgValue::Multiple`] and
    /// `null` members are dropped. Anything other than an object yields no
    /// arguments.
    pub fn from_json(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return Self::default();
        };
        let mut args = Self::new();
        for (key, value) in map {
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    let values = items.iter().filter_map(scalar_to_string).collect();
                    args.push(key.clone(), ArgValue::Multiple(values));
                }
                other => {
                    if let Some(s) = scalar_to_string(other) {
                        args.push(key.clone(), ArgValue::Single(s));
                    }
                }
            }
        }
        args
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

impl<K: Into<String>, V: Into<ArgValue>> FromIterator<(K, V)> for ActionArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Action name plus arguments. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    name: String,
    args: ActionArgs,
}

impl ActionRequest {
    pub fn new(name: impl Into<String>, args: ActionArgs) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &ActionArgs {
        &self.args
    }

    /// Query parameters for this request.
    pub fn params(&self) -> Vec<(String, String)> {
        build_params(&self.name, &self.args)
    }
}

/// Build the ordered query parameters for an AJAM call.
///
/// `("action", name)` always comes first; list-valued arguments expand into
/// repeated keys in list order.
pub fn build_params(action: &str, args: &ActionArgs) -> Vec<(String, String)> {
    let mut params = Vec::with_capacity(args.len() + 1);
    params.push(("action".to_string(), action.to_string()));
    for (key, value) in args.iter() {
        match value {
            ArgValue::Single(v) => params.push((key.to_string(), v.clone())),
            ArgValue::Multiple(values) => {
                params.extend(values.iter().map(|v| (key.to_string(), v.clone())));
            }
        }
    }
    params
}

// ============================================================================
// Parsing
// ============================================================================

/// Split `buffer` into blocks and classify each one.
///
/// Blocks with a `Response` header go to `on_action_result(response,
/// action_id, block)`, blocks with an `Event` header go to
/// `on_event(name, block)`. Everything else is skipped.
pub fn parse_buffer<E, R>(buffer: &[u8], mut on_event: E, mut on_action_result: R)
where
    E: FnMut(&str, AmiBlock),
    R: FnMut(&str, Option<&str>, AmiBlock),
{
    for block in split_blocks(buffer) {
        if let Some(response) = block.response().map(str::to_string) {
            let action_id = block.action_id().map(str::to_string);
            on_action_result(&response, action_id.as_deref(), block);
        } else if let Some(name) = block.event_name().map(str::to_string) {
            on_event(&name, block);
        } else {
            debug!(headers = block.headers.len(), "Skipping AMI block without Response or Event");
        }
    }
}

/// Split `buffer` into parsed blocks without classifying them.
///
/// Blocks with no parsable header line are dropped.
pub fn split_blocks(buffer: &[u8]) -> Vec<AmiBlock> {
    let text = String::from_utf8_lossy(buffer);
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut in_follows = false;

    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);

        if in_follows {
            current.push(line);
            if line.trim_end().ends_with(COMMAND_END) {
                in_follows = false;
                push_block(&mut blocks, &current);
                current.clear();
            }
            continue;
        }

        if line.is_empty() {
            if !current.is_empty() {
                push_block(&mut blocks, &current);
                current.clear();
            }
            continue;
        }

        if is_follows_marker(line) {
            in_follows = true;
        }
        current.push(line);
    }

    // Unterminated trailing block, including a Follows body without sentinel.
    if !current.is_empty() {
        push_block(&mut blocks, &current);
    }
    blocks
}

fn push_block(blocks: &mut Vec<AmiBlock>, lines: &[&str]) {
    match parse_block(lines) {
        Some(block) => blocks.push(block),
        None => debug!(lines = lines.len(), "Skipping AMI block with no headers"),
    }
}

fn is_follows_marker(line: &str) -> bool {
    split_header(line).is_some_and(|(k, v)| {
        k.eq_ignore_ascii_case(HEADER_RESPONSE) && v.eq_ignore_ascii_case(RESPONSE_FOLLOWS)
    })
}

fn split_header(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key, value.trim()))
}

fn parse_block(lines: &[&str]) -> Option<AmiBlock> {
    let follows = lines.first().is_some_and(|l| is_follows_marker(l));
    if follows {
        return Some(parse_follows_block(lines));
    }

    let mut headers = Headers::new();
    for line in lines {
        match split_header(line) {
            Some((key, value)) => {
                headers.insert(key, value);
            }
            None => debug!(line = %line, "Ignoring unparsable AMI line"),
        }
    }
    if headers.is_empty() {
        None
    } else {
        Some(AmiBlock::new(headers))
    }
}

fn parse_follows_block(lines: &[&str]) -> AmiBlock {
    let mut headers = Headers::new();
    headers.insert(HEADER_RESPONSE, RESPONSE_FOLLOWS);
    let (framing, body) = split_framing(&lines[1..]);
    for line in framing {
        if let Some((key, value)) = split_header(line) {
            headers.insert(key, value);
        }
    }
    AmiBlock {
        headers,
        lines: collect_body(body).unwrap_or_default(),
    }
}

/// Separate the `Privilege`/`ActionID` lines that follow the marker.
fn split_framing<'a, 'b>(lines: &'a [&'b str]) -> (&'a [&'b str], &'a [&'b str]) {
    let framed = lines
        .iter()
        .take_while(|line| {
            split_header(line).is_some_and(|(k, _)| {
                FOLLOWS_FRAMING.iter().any(|f| f.eq_ignore_ascii_case(k))
            })
        })
        .count();
    lines.split_at(framed)
}

/// Body lines up to the sentinel, or `None` if the sentinel never appears.
fn collect_body(lines: &[&str]) -> Option<Vec<String>> {
    let mut out = Vec::new();
    for line in lines {
        if let Some(idx) = line.find(COMMAND_END) {
            // Older Asterisk versions append the sentinel to the last output line.
            let prefix = &line[..idx];
            if !prefix.trim().is_empty() {
                out.push(prefix.trim_end().to_string());
            }
            return Some(out);
        }
        out.push(line.to_string());
    }
    None
}

/// Extract raw command output from a `Response: Follows` reply.
///
/// Returns the lines between the framing headers and `--END COMMAND--`,
/// in order and with internal whitespace intact. A reply without the
/// sentinel yields an empty list.
pub fn parse_command_response(buffer: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(buffer);
    let lines: Vec<&str> = text
        .split('\n')
        .map(|raw| raw.strip_suffix('\r').unwrap_or(raw))
        .collect();

    let Some(start) = lines.iter().position(|l| is_follows_marker(l)) else {
        return Vec::new();
    };
    let (_, body) = split_framing(&lines[start + 1..]);
    collect_body(body).unwrap_or_default()
}
