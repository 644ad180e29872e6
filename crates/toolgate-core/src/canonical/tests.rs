//! Golden vectors and unit tests for canonical encoding.

use chrono::{TimeZone, Utc};

use super::*;

/// Golden vectors: input JSON, canonical bytes, SHA-256 hex.
///
/// Sourced from RFC 8785 examples plus composites. These pin the ledger
/// wire format; a change here is a breaking format change.
const VECTORS: &[(&str, &str, &str)] = &[
    (
        r#"{"b": 1, "a": 2}"#,
        r#"{"a":2,"b":1}"#,
        "d3626ac30a87e6f7a6428233b3c68299976865fa5508e4267c5415c76af7a772",
    ),
    // ANGSTROM SIGN (U+212B) normalizes to U+00C5 before encoding.
    (
        "{\"\u{212b}\": 1}",
        "{\"\u{c5}\":1}",
        "3511e6515fb12a08ba57db370f587800037cc69c6c255bac9e16fbcba6de497f",
    ),
    (
        "[3, 2, 1]",
        "[3,2,1]",
        "30c8681f9b840aceee56b737f3b126ae67ec4eb71d2881db831f86014fba016d",
    ),
    (
        r#"{"z": [1, {"a": "x"}]}"#,
        r#"{"z":[1,{"a":"x"}]}"#,
        "c53c1456bf2048c7d5c42ef8e332d78b0b44f0e0267fd559e14b33539e36832b",
    ),
    (
        r#"{"qty": 10, "amount": 1.2300}"#,
        r#"{"amount":1.23,"qty":10}"#,
        "8aff1cb48e852c598b7c6c1f08630332e4765b9f67bd9ea8521917b3b0487edf",
    ),
    (
        r#"{"ts": "2026-01-25T12:00:00.000000Z"}"#,
        r#"{"ts":"2026-01-25T12:00:00.000000Z"}"#,
        "7a806ff16cfd376f2e1bbb296a6ba367e88686f992b74e8574256e3ed53d5f24",
    ),
];

#[test]
fn golden_vectors_are_stable() {
    for (input, expected_text, expected_sha) in VECTORS {
        let value = Value::from_json_str(input).expect("vector must parse");
        assert_eq!(
            to_canonical_json(&value).unwrap(),
            *expected_text,
            "canonical text for {input}"
        );
        assert_eq!(
            canonical_sha256_hex(&value).unwrap(),
            *expected_sha,
            "canonical hash for {input}"
        );
    }
}

#[test]
fn canonical_form_round_trips() {
    for (input, _, _) in VECTORS {
        let value = Value::from_json_str(input).unwrap();
        let first = to_canonical_json(&value).unwrap();
        let reparsed = Value::from_json_str(&first).unwrap();
        assert_eq!(to_canonical_json(&reparsed).unwrap(), first);
    }
}

#[test]
fn hash_is_stable_across_key_order() {
    let one =
        Value::from_json_str(r#"{"b":1,"a":{"y":[3,{"z":1.2300,"a":2}],"x":"value"}}"#).unwrap();
    let two =
        Value::from_json_str(r#"{"a":{"x":"value","y":[3,{"a":2,"z":1.230}]},"b":1}"#).unwrap();

    let dump_one = to_canonical_json(&one).unwrap();
    let dump_two = to_canonical_json(&two).unwrap();
    assert_eq!(dump_one, dump_two);
    assert!(dump_one.contains(r#""z":1.23"#));
    assert_eq!(
        canonical_sha256_hex(&one).unwrap(),
        canonical_sha256_hex(&two).unwrap()
    );
}

#[test]
fn decimal_normalization() {
    for (input, expected) in [
        ("1.2300", "1.23"),
        ("1.0", "1"),
        ("0.0", "0"),
        ("-0", "0"),
        ("-0.0", "0"),
        ("0.05", "0.05"),
        ("1e3", "1000"),
        ("1.5e1", "15"),
        ("25e-2", "0.25"),
        ("-12.340", "-12.34"),
        ("007", "7"),
        // Dangling decimal points are trimmed, not rejected.
        ("1.", "1"),
        (".5", "0.5"),
    ] {
        assert_eq!(Number::parse(input).unwrap().as_str(), expected, "{input}");
    }
}

#[test]
fn malformed_numbers_are_rejected() {
    for input in ["", "+1", ".", "1e", "abc", "--1", "1.2.3", "1e2.5"] {
        assert!(Number::parse(input).is_err(), "{input:?} must be rejected");
    }
}

#[test]
fn oversized_numbers_are_rejected() {
    assert!(matches!(
        Number::parse("1e200"),
        Err(CanonicalError::NumberTooLong { .. })
    ));
}

#[test]
fn timestamps_render_with_microseconds() {
    let at = Utc.with_ymd_and_hms(2026, 1, 25, 12, 0, 0).unwrap();
    assert_eq!(format_timestamp(at), "2026-01-25T12:00:00.000000Z");

    let at = at + chrono::Duration::microseconds(123_456);
    assert_eq!(format_timestamp(at), "2026-01-25T12:00:00.123456Z");
}

#[test]
fn strings_are_nfc_normalized() {
    // U+0041 U+030A (A + combining ring) normalizes to U+00C5.
    let value = Value::string("A\u{030A}");
    assert_eq!(value.as_str(), Some("\u{c5}"));
}

#[test]
fn duplicate_keys_after_normalization_are_rejected() {
    let mut json = serde_json::Map::new();
    json.insert("A\u{030A}".to_string(), serde_json::Value::from(1));
    json.insert("\u{c5}".to_string(), serde_json::Value::from(2));
    let err = Value::from_json(&serde_json::Value::Object(json)).unwrap_err();
    assert!(matches!(err, CanonicalError::DuplicateKey { .. }));
}

#[test]
fn mandatory_escapes_only() {
    let value = Value::string("a\"b\\c/d\ne\u{0001}");
    let text = to_canonical_json(&value).unwrap();
    assert_eq!(text, "\"a\\\"b\\\\c/d\\ne\\u0001\"");
}

#[test]
fn depth_limit_is_enforced() {
    let mut nested = Value::Array(vec![Value::Null]);
    for _ in 0..MAX_DEPTH + 1 {
        nested = Value::Array(vec![nested]);
    }
    assert_eq!(
        to_canonical_json(&nested).unwrap_err(),
        CanonicalError::MaxDepthExceeded
    );
}
