//! Tests for the ledger backends and chain verification.

use tempfile::TempDir;

use crate::canonical::{Map, Value};
use crate::crypto::generate_keypair;

use super::entry::compute_decision_hash;
use super::*;

const CREATED_AT: &str = "2026-01-25T12:00:00.000000Z";

fn empty_parameters() -> Value {
    let mut parameters = Map::new();
    parameters.insert("args".to_string(), Value::Array(Vec::new()));
    parameters.insert("kwargs".to_string(), Value::Object(Map::new()));
    Value::Object(parameters)
}

/// Builds a decision entry whose decision hash is internally consistent.
fn decision_entry(request_id: &str, action: &str) -> Map {
    let parameters = empty_parameters();
    let policy_hash = "a".repeat(64);
    let decision_hash = compute_decision_hash(
        request_id,
        CREATED_AT,
        &policy_hash,
        action,
        &parameters,
        "agent-1",
    )
    .expect("decision hash");

    let mut decision = Map::new();
    decision.insert("effect".to_string(), Value::string("allow"));
    decision.insert("reason".to_string(), Value::string("within limit"));
    decision.insert(
        "reason_code".to_string(),
        Value::string("POLICY_ALLOW_LOW_RISK"),
    );
    decision.insert("policy_id".to_string(), Value::string("allow_all"));
    decision.insert("policy_hash".to_string(), Value::string(&policy_hash));
    decision.insert("decision_hash".to_string(), Value::string(&decision_hash));

    let mut entry = Map::new();
    entry.insert("schema_version".to_string(), Value::string(SCHEMA_VERSION));
    entry.insert("ledger_version".to_string(), Value::string(LEDGER_VERSION));
    entry.insert("request_id".to_string(), Value::string(request_id));
    entry.insert("created_at".to_string(), Value::string(CREATED_AT));
    entry.insert("event".to_string(), Value::string("decision"));
    entry.insert("action".to_string(), Value::string(action));
    entry.insert("agent_id".to_string(), Value::string("agent-1"));
    entry.insert("decision".to_string(), Value::Object(decision));
    entry.insert("approval".to_string(), Value::Null);
    entry.insert("parameters".to_string(), parameters);
    entry.insert("metadata".to_string(), Value::Object(Map::new()));
    entry
}

/// Builds an outcome entry referencing the given decision entry.
fn outcome_entry(request_id: &str, action: &str, decision_hash: &str) -> Map {
    let mut decision = Map::new();
    decision.insert("decision_hash".to_string(), Value::string(decision_hash));
    decision.insert("policy_id".to_string(), Value::string("allow_all"));
    decision.insert("policy_hash".to_string(), Value::string("a".repeat(64)));
    decision.insert("reason".to_string(), Value::string("within limit"));

    let mut outcome = Map::new();
    outcome.insert("status".to_string(), Value::string("success"));
    outcome.insert("error_type".to_string(), Value::Null);
    outcome.insert("error".to_string(), Value::Null);

    let mut entry = Map::new();
    entry.insert("schema_version".to_string(), Value::string(SCHEMA_VERSION));
    entry.insert("ledger_version".to_string(), Value::string(LEDGER_VERSION));
    entry.insert("request_id".to_string(), Value::string(request_id));
    entry.insert(
        "created_at".to_string(),
        Value::string("2026-01-25T12:00:01.000000Z"),
    );
    entry.insert("event".to_string(), Value::string("outcome"));
    entry.insert("action".to_string(), Value::string(action));
    entry.insert("agent_id".to_string(), Value::string("agent-1"));
    entry.insert("decision".to_string(), Value::Object(decision));
    entry.insert("outcome".to_string(), Value::Object(outcome));
    entry.insert("parameters".to_string(), empty_parameters());
    entry
}

fn decision_hash_of(entry: &Map) -> String {
    entry["decision"]
        .as_object()
        .and_then(|d| d.get("decision_hash"))
        .and_then(Value::as_str)
        .expect("decision hash")
        .to_string()
}

fn temp_jsonl() -> (JsonlLedger, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let ledger = JsonlLedger::new(dir.path().join("ledger.jsonl"));
    (ledger, dir)
}

#[test]
fn jsonl_append_and_verify_round_trip() {
    let (ledger, _dir) = temp_jsonl();
    let decision = decision_entry("req-1", "billing.refund");
    let decision_hash = decision_hash_of(&decision);
    ledger.append_blocking(decision).expect("append decision");
    ledger
        .append_blocking(outcome_entry("req-1", "billing.refund", &decision_hash))
        .expect("append outcome");

    let report = ledger.verify_blocking(None).expect("verify");
    assert!(report.ok, "{report:?}");
    assert_eq!(report.entries, 2);
    assert!(report.signatures_checked.is_none());
}

#[test]
fn jsonl_chain_links_entries() {
    let (ledger, _dir) = temp_jsonl();
    let first = ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");
    let contents = std::fs::read_to_string(ledger.path()).expect("read");
    let first_line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap())
        .expect("parse");
    assert!(first_line["prev_entry_hash"].is_null());
    assert_eq!(first_line["entry_hash"].as_str(), Some(first.as_str()));

    ledger
        .append_blocking(decision_entry("req-2", "a.b"))
        .expect("append");
    let contents = std::fs::read_to_string(ledger.path()).expect("read");
    let second_line: serde_json::Value =
        serde_json::from_str(contents.lines().nth(1).unwrap()).expect("parse");
    assert_eq!(second_line["prev_entry_hash"].as_str(), Some(first.as_str()));
}

#[test]
fn tampered_reason_is_detected_at_position_zero() {
    let (ledger, _dir) = temp_jsonl();
    ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");

    let contents = std::fs::read_to_string(ledger.path()).expect("read");
    let tampered = contents.replace("within limit", "within  limit");
    assert_ne!(contents, tampered);
    std::fs::write(ledger.path(), tampered).expect("write");

    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    let failure = report.first_failure.expect("failure");
    assert_eq!(failure.position, 0);
    assert_eq!(failure.kind, FailureKind::Tamper);
}

#[test]
fn reordered_entries_break_the_chain() {
    let (ledger, _dir) = temp_jsonl();
    ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");
    ledger
        .append_blocking(decision_entry("req-2", "a.b"))
        .expect("append");

    let contents = std::fs::read_to_string(ledger.path()).expect("read");
    let mut lines: Vec<&str> = contents.lines().collect();
    lines.swap(0, 1);
    std::fs::write(ledger.path(), format!("{}\n{}\n", lines[0], lines[1])).expect("write");

    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    let failure = report.first_failure.expect("failure");
    assert_eq!(failure.position, 0);
    assert_eq!(failure.kind, FailureKind::ChainBreak);
}

#[test]
fn deleted_entry_breaks_the_chain() {
    let (ledger, _dir) = temp_jsonl();
    for request in ["req-1", "req-2", "req-3"] {
        ledger
            .append_blocking(decision_entry(request, "a.b"))
            .expect("append");
    }
    let contents = std::fs::read_to_string(ledger.path()).expect("read");
    let kept: Vec<&str> = contents.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
    std::fs::write(ledger.path(), format!("{}\n{}\n", kept[0], kept[1])).expect("write");

    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    let failure = report.first_failure.expect("failure");
    assert_eq!(failure.position, 1);
    assert_eq!(failure.kind, FailureKind::ChainBreak);
}

#[test]
fn torn_trailing_line_reports_truncation_and_recovers_on_append() {
    let (ledger, _dir) = temp_jsonl();
    ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");

    // Simulate a crash mid-append.
    use std::io::Write as _;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(ledger.path())
        .expect("open");
    file.write_all(b"{\"schema_version\":\"2.0\",\"partial")
        .expect("write");
    drop(file);

    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    let failure = report.first_failure.expect("failure");
    assert_eq!(failure.position, 1);
    assert_eq!(failure.kind, FailureKind::CanonicalForm);
    assert!(failure.detail.contains("truncated"));

    // The next append discards the torn tail and re-chains cleanly.
    ledger
        .append_blocking(decision_entry("req-2", "a.b"))
        .expect("append after torn tail");
    let report = ledger.verify_blocking(None).expect("verify");
    assert!(report.ok, "{report:?}");
    assert_eq!(report.entries, 2);
}

#[test]
fn signed_entries_verify_and_reject_wrong_key() {
    let dir = TempDir::new().expect("temp dir");
    let (signing_key, verifying_key) = generate_keypair();
    let (_, other_key) = generate_keypair();
    let ledger = JsonlLedger::with_signing_key(dir.path().join("ledger.jsonl"), signing_key);
    ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");

    let report = ledger.verify_blocking(Some(&verifying_key)).expect("verify");
    assert!(report.ok, "{report:?}");
    assert_eq!(report.signatures_checked, Some(1));

    let report = ledger.verify_blocking(Some(&other_key)).expect("verify");
    assert!(!report.ok);
    assert_eq!(report.first_failure.expect("failure").kind, FailureKind::Signature);

    // Unsigned verification still accepts the signed ledger.
    let report = ledger.verify_blocking(None).expect("verify");
    assert!(report.ok);
}

#[test]
fn unsigned_entries_fail_keyed_verification() {
    let (ledger, _dir) = temp_jsonl();
    ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");
    let (_, verifying_key) = generate_keypair();
    let report = ledger.verify_blocking(Some(&verifying_key)).expect("verify");
    assert!(!report.ok);
    assert_eq!(report.first_failure.expect("failure").kind, FailureKind::Signature);
}

#[test]
fn orphan_outcome_is_detected() {
    let (ledger, _dir) = temp_jsonl();
    ledger
        .append_blocking(outcome_entry("req-1", "a.b", &"b".repeat(64)))
        .expect("append");
    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    assert_eq!(
        report.first_failure.expect("failure").kind,
        FailureKind::OrphanOutcome
    );
}

#[test]
fn outcome_bound_to_wrong_request_is_detected() {
    let (ledger, _dir) = temp_jsonl();
    let decision = decision_entry("req-1", "a.b");
    let decision_hash = decision_hash_of(&decision);
    ledger.append_blocking(decision).expect("append");
    ledger
        .append_blocking(outcome_entry("req-other", "a.b", &decision_hash))
        .expect("append");
    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    assert_eq!(
        report.first_failure.expect("failure").kind,
        FailureKind::BoundMismatch
    );
}

#[test]
fn duplicate_decision_hash_is_detected() {
    let (ledger, _dir) = temp_jsonl();
    ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");
    ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");
    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    let failure = report.first_failure.expect("failure");
    assert_eq!(failure.position, 1);
    assert_eq!(failure.kind, FailureKind::BoundMismatch);
}

#[test]
fn schema_version_mismatch_is_detected() {
    let (ledger, _dir) = temp_jsonl();
    let mut entry = decision_entry("req-1", "a.b");
    entry.insert("schema_version".to_string(), Value::string("1.0"));
    ledger.append_blocking(entry).expect("append");
    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    assert_eq!(report.first_failure.expect("failure").kind, FailureKind::Version);
}

#[test]
fn missing_file_verifies_empty() {
    let dir = TempDir::new().expect("temp dir");
    let ledger = JsonlLedger::new(dir.path().join("absent.jsonl"));
    let report = ledger.verify_blocking(None).expect("verify");
    assert!(report.ok);
    assert_eq!(report.entries, 0);
}

#[test]
fn sqlite_append_and_verify_round_trip() {
    let dir = TempDir::new().expect("temp dir");
    let ledger = SqliteLedger::open(dir.path().join("ledger.db")).expect("open");
    let decision = decision_entry("req-1", "billing.refund");
    let decision_hash = decision_hash_of(&decision);
    ledger.append_blocking(decision).expect("append");
    ledger
        .append_blocking(outcome_entry("req-1", "billing.refund", &decision_hash))
        .expect("append");

    let report = ledger.verify_blocking(None).expect("verify");
    assert!(report.ok, "{report:?}");
    assert_eq!(report.entries, 2);
}

#[test]
fn sqlite_detects_tampered_body() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("ledger.db");
    let ledger = SqliteLedger::open(&path).expect("open");
    ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");
    drop(ledger);

    let conn = rusqlite::Connection::open(&path).expect("open raw");
    conn.execute(
        "UPDATE ledger SET entry_json = replace(entry_json, 'within limit', 'within  limit')",
        [],
    )
    .expect("tamper");
    drop(conn);

    let ledger = SqliteLedger::open(&path).expect("reopen");
    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    assert_eq!(report.first_failure.expect("failure").kind, FailureKind::Tamper);
}

#[test]
fn sqlite_detects_column_body_mismatch() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("ledger.db");
    let ledger = SqliteLedger::open(&path).expect("open");
    ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");
    drop(ledger);

    let conn = rusqlite::Connection::open(&path).expect("open raw");
    conn.execute(
        &format!("UPDATE ledger SET entry_hash = '{}'", "c".repeat(64)),
        [],
    )
    .expect("tamper");
    drop(conn);

    let ledger = SqliteLedger::open(&path).expect("reopen");
    let report = ledger.verify_blocking(None).expect("verify");
    assert!(!report.ok);
    assert_eq!(report.first_failure.expect("failure").kind, FailureKind::Tamper);
}

#[test]
fn read_verified_returns_entries_with_chain_state() {
    let (ledger, _dir) = temp_jsonl();
    let first = ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");
    let second = ledger
        .append_blocking(decision_entry("req-2", "a.b"))
        .expect("append");

    let entries = ledger.read_verified_blocking(None).expect("read");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].1, first);
    assert_eq!(entries[1].1, second);
    assert_eq!(
        entries[0].0.get("request_id").and_then(Value::as_str),
        Some("req-1")
    );

    // A tampered chain refuses to yield entries at all.
    let contents = std::fs::read_to_string(ledger.path()).expect("read");
    std::fs::write(ledger.path(), contents.replace("req-2", "req-9")).expect("write");
    let err = ledger.read_verified_blocking(None).unwrap_err();
    assert!(matches!(err, LedgerError::Corrupt { .. }));
}

#[test]
fn sqlite_read_verified_matches_columns() {
    let dir = TempDir::new().expect("temp dir");
    let ledger = SqliteLedger::open(dir.path().join("ledger.db")).expect("open");
    let hash = ledger
        .append_blocking(decision_entry("req-1", "a.b"))
        .expect("append");
    let entries = ledger.read_verified_blocking(None).expect("read");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1, hash);
}

#[tokio::test]
async fn async_trait_surface_appends_and_verifies() {
    let dir = TempDir::new().expect("temp dir");
    let ledger = JsonlLedger::new(dir.path().join("ledger.jsonl"));
    let ledger: &dyn Ledger = &ledger;
    ledger
        .append(decision_entry("req-1", "a.b"))
        .await
        .expect("append");
    let report = ledger.verify(None).await.expect("verify");
    assert!(report.ok);
    assert_eq!(report.entries, 1);
}
