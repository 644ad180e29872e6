//! Canonical JSON rendering and hashing.

use sha2::{Digest, Sha256};

use super::{CanonicalError, MAX_DEPTH, Value};

/// Renders a value as canonical JSON text.
///
/// # Errors
///
/// Returns [`CanonicalError::MaxDepthExceeded`] for nesting beyond
/// [`MAX_DEPTH`].
pub fn to_canonical_json(value: &Value) -> Result<String, CanonicalError> {
    let mut out = String::new();
    render(value, 0, &mut out)?;
    Ok(out)
}

/// Returns the lowercase-hex SHA-256 of the canonical encoding.
///
/// This is the single hashing entry point behind `policy_hash`,
/// `decision_hash`, and `entry_hash`.
///
/// # Errors
///
/// Propagates encoding errors from [`to_canonical_json`].
pub fn canonical_sha256_hex(value: &Value) -> Result<String, CanonicalError> {
    let text = to_canonical_json(value)?;
    let digest = Sha256::digest(text.as_bytes());
    Ok(hex::encode(digest))
}

fn render(value: &Value, depth: usize, out: &mut String) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded);
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => out.push_str(number.as_str()),
        Value::String(text) => render_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                render(item, depth + 1, out)?;
            }
            out.push(']');
        }
        Value::Object(entries) => {
            out.push('{');
            for (index, (key, item)) in entries.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                render_string(key, out);
                out.push(':');
                render(item, depth + 1, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Emits a JSON string with only the mandatory escapes.
///
/// `/` is never escaped; non-ASCII passes through as raw UTF-8.
fn render_string(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if (ch as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", ch as u32));
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
}
