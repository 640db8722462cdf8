//! `{placeholder}` templates for event names, routing keys and ACLs.

use serde_json::Value;

use super::{EventError, Result};

/// Replace routing-key metacharacters in a value.
///
/// `.` separates routing-key segments while `*` and `#` are topic wildcards,
/// so none of them may leak out of a substituted value.
pub fn escape(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '.' | '*' | '#' => '_',
            other => other,
        })
        .collect()
}

/// Render `template`, resolving each `{field}` through `lookup`.
///
/// String values are passed through [`escape`] when `escape_values` is set.
/// A placeholder that resolves to nothing, to `null`, or to a non-scalar is a
/// configuration error.
pub fn render<F>(template: &str, lookup: F, escape_values: bool) -> Result<String>
where
    F: Fn(&str) -> Option<Value>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            EventError::Configuration(format!("unterminated placeholder in template '{}'", template))
        })?;
        let field = &after[..end];
        let value = lookup(field).ok_or_else(|| missing(field, template))?;
        let rendered = match value {
            Value::String(s) if escape_values => escape(&s),
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(missing(field, template)),
        };
        out.push_str(&rendered);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn missing(field: &str, template: &str) -> EventError {
    EventError::Configuration(format!(
        "field '{}' required by template '{}' is missing",
        field, template
    ))
}
