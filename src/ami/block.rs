//! Parsed AMI protocol units.
//!
//! An [`AmiBlock`] is one blank-line-delimited unit of the Manager Interface
//! wire format: ordered `Key: Value` headers plus, for `Response: Follows`
//! command output, the raw body lines.

use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Header carrying the action-result discriminator.
pub const HEADER_RESPONSE: &str = "Response";
/// Header carrying the unsolicited-event discriminator.
pub const HEADER_EVENT: &str = "Event";
/// Header correlating a block with the caller's action.
pub const HEADER_ACTION_ID: &str = "ActionID";
/// Human-readable status text on action results.
pub const HEADER_MESSAGE: &str = "Message";

/// Headers that may legitimately repeat within one block.
///
/// For every other key the first occurrence wins.
pub const MULTI_VALUED_HEADERS: &[&str] = &["Variable", "ChanVariable", "Output"];

/// Check whether a header name accumulates repeated values.
pub fn is_multi_valued(key: &str) -> bool {
    MULTI_VALUED_HEADERS
        .iter()
        .any(|k| k.eq_ignore_ascii_case(key))
}

/// Ordered header map with AMI duplicate-key semantics.
///
/// Lookups are case-sensitive on insert order but case-insensitive on read,
/// matching how Asterisk treats header names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header.
    ///
    /// Returns `false` when the key already exists and is not multi-valued,
    /// in which case the existing value is kept.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if !is_multi_valued(&key) && self.contains(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in wire order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of these headers without the given keys.
    pub fn without(&self, excluded: &[&str]) -> Headers {
        Headers {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| !excluded.iter().any(|e| e.eq_ignore_ascii_case(k)))
                .cloned()
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Serializes as a JSON object. Repeated keys collapse into an array.
impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seen: Vec<&str> = Vec::with_capacity(self.entries.len());
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in &self.entries {
            if seen.iter().any(|s| s.eq_ignore_ascii_case(key)) {
                continue;
            }
            seen.push(key);
            if is_multi_valued(key) {
                let values: Vec<&str> = self.get_all(key).collect();
                map.serialize_entry(key, &values)?;
            } else {
                map.serialize_entry(key, value)?;
            }
        }
        map.end()
    }
}

/// One parsed AMI protocol unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmiBlock {
    pub headers: Headers,
    /// Raw body lines of a `Response: Follows` block, framing excluded.
    pub lines: Vec<String>,
}

impl AmiBlock {
    pub fn new(headers: Headers) -> Self {
        Self {
            headers,
            lines: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Value of the `Response` header, if this is an action result.
    pub fn response(&self) -> Option<&str> {
        self.get(HEADER_RESPONSE)
    }

    /// Value of the `Event` header, if this is an unsolicited event.
    pub fn event_name(&self) -> Option<&str> {
        self.get(HEADER_EVENT)
    }

    pub fn action_id(&self) -> Option<&str> {
        self.get(HEADER_ACTION_ID)
    }

    pub fn is_action_result(&self) -> bool {
        self.response().is_some()
    }

    pub fn is_event(&self) -> bool {
        !self.is_action_result() && self.event_name().is_some()
    }

    /// Encode back to the wire format, terminated by the blank separator line.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.headers.iter() {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        for line in &self.lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

impl fmt::Display for AmiBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.response(), self.event_name()) {
            (Some(response), _) => write!(f, "<AmiBlock Response={}>", response),
            (None, Some(event)) => write!(f, "<AmiBlock Event={}>", event),
            (None, None) => write!(f, "<AmiBlock headers={}>", self.headers.len()),
        }
    }
}
