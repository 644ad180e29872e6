//! Canonical value model and deterministic JSON encoding.
//!
//! Every hash in the ledger (`policy_hash`, `decision_hash`, `entry_hash`)
//! is SHA-256 over the canonical encoding produced by this module, so the
//! encoding rules are a wire-format contract: changing them is a breaking
//! ledger-format change. The profile follows RFC 8785 (JCS) with additional
//! constraints:
//!
//! - **Exact numbers only**: integers and fixed-point decimals. Float
//!   exclusion is structural: [`Value`] has no binary-float variant and no
//!   `From<f64>` impl, so `NaN`, infinities, and platform-dependent float
//!   encodings cannot be represented at all.
//! - **NFC strings**: all strings (including object keys) are normalized to
//!   Unicode NFC before encoding.
//! - **Deterministic objects**: keys are sorted byte-lexicographically after
//!   normalization; duplicate keys after normalization are rejected.
//! - **Minimal syntax**: separators are `,` and `:` only, no whitespace,
//!   only JSON-mandatory escapes (`/` is never escaped).
//! - **Bounded depth**: nesting beyond 128 levels is rejected.
//!
//! Timestamps are not a distinct variant; callers format them with
//! [`format_timestamp`] (`YYYY-MM-DDTHH:MM:SS.ssssssZ`) and carry them as
//! strings.
//!
//! # Example
//!
//! ```
//! use toolgate_core::canonical::{Value, to_canonical_json};
//!
//! let mut obj = toolgate_core::canonical::Map::new();
//! obj.insert("z".to_string(), Value::from(1i64));
//! obj.insert("a".to_string(), Value::from("x"));
//! let canonical = to_canonical_json(&Value::Object(obj)).unwrap();
//! assert_eq!(canonical, r#"{"a":"x","z":1}"#);
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use unicode_normalization::{IsNormalized, UnicodeNormalization, is_nfc_quick};

mod encode;

#[cfg(test)]
mod tests;

pub use encode::{canonical_sha256_hex, to_canonical_json};

/// Maximum nesting depth accepted by conversion and encoding.
pub const MAX_DEPTH: usize = 128;

/// Maximum rendered length of a single number, bounding exponent expansion.
pub const MAX_NUMBER_LENGTH: usize = 128;

/// Errors produced while building or encoding canonical values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// A numeric literal could not be parsed as an exact decimal.
    #[error("invalid number: {value:?}")]
    InvalidNumber {
        /// The offending literal.
        value: String,
    },

    /// A number expanded past [`MAX_NUMBER_LENGTH`] characters.
    #[error("number too long after normalization: {value:?}")]
    NumberTooLong {
        /// The offending literal.
        value: String,
    },

    /// Two object keys collided after NFC normalization.
    #[error("duplicate key after normalization: {key:?}")]
    DuplicateKey {
        /// The colliding key.
        key: String,
    },

    /// Nesting exceeded [`MAX_DEPTH`].
    #[error("nesting exceeds {MAX_DEPTH} levels")]
    MaxDepthExceeded,

    /// Input JSON text could not be parsed.
    #[error("JSON parse error: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },
}

/// String-keyed object body; keys are NFC-normalized and kept sorted.
pub type Map = BTreeMap<String, Value>;

/// An exact decimal number in canonical form.
///
/// The inner text is already normalized: optional leading `-`, no exponent,
/// no superfluous leading zeros, no trailing fractional zeros, no dangling
/// decimal point, and `-0` collapsed to `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Number(String);

impl Number {
    /// Builds a number from a decimal literal, normalizing it.
    ///
    /// Accepts the JSON number grammar (including exponents, which are
    /// expanded to fixed-point form).
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError::InvalidNumber`] for malformed literals and
    /// [`CanonicalError::NumberTooLong`] when expansion exceeds the length
    /// bound.
    pub fn parse(text: &str) -> Result<Self, CanonicalError> {
        normalize_decimal(text).map(Self)
    }

    /// Returns the canonical decimal text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<u32> for Number {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

/// A value in the canonical universe.
///
/// The universe is deliberately restricted: anything representable here has
/// exactly one canonical encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// Exact decimal number.
    Number(Number),
    /// NFC-normalized string.
    String(String),
    /// Ordered sequence; author order is preserved.
    Array(Vec<Value>),
    /// String-keyed mapping; keys sorted by the map itself.
    Object(Map),
}

impl Value {
    /// Builds a string value, normalizing to NFC.
    #[must_use]
    pub fn string(text: impl AsRef<str>) -> Self {
        Self::String(nfc(text.as_ref()))
    }

    /// Returns the contained string, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained object, if this is an object value.
    #[must_use]
    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Converts a parsed [`serde_json::Value`] into the canonical universe.
    ///
    /// Numbers are normalized from their literal text (the crate is built
    /// with `arbitrary_precision`, so decimal literals survive parsing
    /// exactly). Strings and keys are NFC-normalized. Float exclusion is
    /// structural, not a runtime check: there is no path that admits an
    /// `f64`, so every number reaching this conversion is already exact
    /// decimal text.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed numbers, key collisions after
    /// normalization, or nesting beyond [`MAX_DEPTH`].
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CanonicalError> {
        from_json_at_depth(json, 0)
    }

    /// Parses canonical-candidate JSON text into the canonical universe.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError::Parse`] for syntactically invalid JSON and
    /// the conversion errors of [`Value::from_json`] otherwise.
    pub fn from_json_str(text: &str) -> Result<Self, CanonicalError> {
        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|err| CanonicalError::Parse {
                message: err.to_string(),
            })?;
        Self::from_json(&json)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(Number::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::string(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Formats a UTC timestamp in the canonical `YYYY-MM-DDTHH:MM:SS.ssssssZ`
/// form (microsecond precision, `Z` suffix).
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn nfc(text: &str) -> String {
    match is_nfc_quick(text.chars()) {
        IsNormalized::Yes => text.to_string(),
        _ => text.nfc().collect(),
    }
}

fn from_json_at_depth(json: &serde_json::Value, depth: usize) -> Result<Value, CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded);
    }
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(flag) => Ok(Value::Bool(*flag)),
        serde_json::Value::Number(number) => {
            Ok(Value::Number(Number::parse(&number.to_string())?))
        }
        serde_json::Value::String(text) => Ok(Value::string(text)),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_json_at_depth(item, depth + 1)?);
            }
            Ok(Value::Array(out))
        }
        serde_json::Value::Object(entries) => {
            let mut out = Map::new();
            for (raw_key, raw_value) in entries {
                let key = nfc(raw_key);
                let value = from_json_at_depth(raw_value, depth + 1)?;
                if out.insert(key.clone(), value).is_some() {
                    return Err(CanonicalError::DuplicateKey { key });
                }
            }
            Ok(Value::Object(out))
        }
    }
}

/// Normalizes a decimal literal to canonical fixed-point text.
fn normalize_decimal(text: &str) -> Result<String, CanonicalError> {
    let invalid = || CanonicalError::InvalidNumber {
        value: text.to_string(),
    };

    let mut rest = text.trim();
    if rest.is_empty() {
        return Err(invalid());
    }
    let negative = if let Some(stripped) = rest.strip_prefix('-') {
        rest = stripped;
        true
    } else {
        false
    };
    if rest.starts_with('+') {
        return Err(invalid());
    }

    let (mantissa, exponent_text) = match rest.find(['e', 'E']) {
        Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
        None => (rest, None),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(pos) => (&mantissa[..pos], &mantissa[pos + 1..]),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let exponent: i64 = match exponent_text {
        Some(exp) if exp.is_empty() => return Err(invalid()),
        Some(exp) => exp.parse().map_err(|_| invalid())?,
        None => 0,
    };
    if exponent.unsigned_abs() > MAX_NUMBER_LENGTH as u64 {
        return Err(CanonicalError::NumberTooLong {
            value: text.to_string(),
        });
    }

    // Digits with the decimal point removed; scale counts fractional digits.
    let mut digits: Vec<u8> = int_part.bytes().chain(frac_part.bytes()).collect();
    let mut scale = i64::try_from(frac_part.len()).map_err(|_| invalid())? - exponent;

    // Trim trailing zeros that sit in the fractional range.
    while scale > 0 && digits.last() == Some(&b'0') {
        digits.pop();
        scale -= 1;
    }
    // Trim leading zeros.
    let first_nonzero = digits.iter().position(|b| *b != b'0');
    match first_nonzero {
        None => return Ok("0".to_string()),
        Some(lead) => {
            digits.drain(..lead);
        }
    }

    let digit_count = i64::try_from(digits.len()).map_err(|_| invalid())?;
    let rendered_len = if scale <= 0 {
        digit_count + scale.unsigned_abs() as i64
    } else {
        digit_count.max(scale) + 2
    };
    if rendered_len > MAX_NUMBER_LENGTH as i64 {
        return Err(CanonicalError::NumberTooLong {
            value: text.to_string(),
        });
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if scale <= 0 {
        for b in &digits {
            out.push(char::from(*b));
        }
        for _ in 0..scale.unsigned_abs() {
            out.push('0');
        }
    } else if digit_count > scale {
        let split = usize::try_from(digit_count - scale).map_err(|_| invalid())?;
        for b in &digits[..split] {
            out.push(char::from(*b));
        }
        out.push('.');
        for b in &digits[split..] {
            out.push(char::from(*b));
        }
    } else {
        out.push_str("0.");
        for _ in 0..(scale - digit_count) {
            out.push('0');
        }
        for b in &digits {
            out.push(char::from(*b));
        }
    }
    Ok(out)
}
