//! Command tests over a real evidence ledger.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use toolgate_core::engine::{BlockingEngine, CallArgs, CallOptions, Engine};
use toolgate_core::ledger::JsonlLedger;
use toolgate_core::policy::AllowAll;

use super::export::{Filters, OutputFormat, run_export, run_filter, run_search};
use super::{keygen, receipt, verify};

/// Writes a two-entry ledger (decision + outcome) through the engine.
fn seeded_ledger(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("evidence.jsonl");
    let engine = Engine::builder()
        .policy(Arc::new(AllowAll))
        .ledger(Arc::new(JsonlLedger::new(&path)))
        .agent_id("agent-1")
        .build()
        .expect("engine");
    let engine = BlockingEngine::new(engine).expect("runtime");
    engine
        .execute(
            "billing.refund",
            CallArgs::new().kwarg("user", "u1").kwarg("amount", 10i64),
            CallOptions::default(),
            || Ok::<_, std::io::Error>(10i64),
        )
        .expect("guarded call");
    path
}

fn request_id_of(path: &Path) -> String {
    let contents = std::fs::read_to_string(path).expect("read ledger");
    let first: serde_json::Value =
        serde_json::from_str(contents.lines().next().expect("line")).expect("parse");
    first["request_id"].as_str().expect("request id").to_string()
}

#[test]
fn verify_reports_ok_for_valid_ledger() {
    let dir = TempDir::new().expect("temp dir");
    let path = seeded_ledger(&dir);
    let code = verify::run(Some(path), true, None).expect("verify");
    assert_eq!(code, 0);
}

#[test]
fn verify_fails_on_tampered_ledger() {
    let dir = TempDir::new().expect("temp dir");
    let path = seeded_ledger(&dir);
    let contents = std::fs::read_to_string(&path).expect("read");
    std::fs::write(&path, contents.replace("allowed", "allowed!")).expect("write");
    let code = verify::run(Some(path), true, None).expect("verify");
    assert_eq!(code, 1);
}

#[test]
fn export_ndjson_round_trips_entries() {
    let dir = TempDir::new().expect("temp dir");
    let path = seeded_ledger(&dir);
    let out = dir.path().join("export.ndjson");
    let code = run_export(Some(path), OutputFormat::Ndjson, Some(out.clone())).expect("export");
    assert_eq!(code, 0);

    let contents = std::fs::read_to_string(&out).expect("read export");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).expect("parse");
    assert_eq!(first["event"], "decision");
}

#[test]
fn export_csv_has_header_and_rows() {
    let dir = TempDir::new().expect("temp dir");
    let path = seeded_ledger(&dir);
    let out = dir.path().join("export.csv");
    let code = run_export(Some(path), OutputFormat::Csv, Some(out.clone())).expect("export");
    assert_eq!(code, 0);

    let contents = std::fs::read_to_string(&out).expect("read export");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("created_at,event,action"));
    assert!(lines[1].contains("billing.refund"));
}

#[test]
fn filter_by_request_id_keeps_both_events() {
    let dir = TempDir::new().expect("temp dir");
    let path = seeded_ledger(&dir);
    let request_id = request_id_of(&path);
    let out = dir.path().join("filtered.ndjson");
    let code = run_filter(
        Some(path),
        Filters {
            request_id: Some(request_id),
            ..Filters::default()
        },
        OutputFormat::Ndjson,
        Some(out.clone()),
    )
    .expect("filter");
    assert_eq!(code, 0);
    let contents = std::fs::read_to_string(&out).expect("read");
    assert_eq!(contents.lines().count(), 2);
}

#[test]
fn filter_rejects_invalid_timestamps() {
    let dir = TempDir::new().expect("temp dir");
    let path = seeded_ledger(&dir);
    let code = run_filter(
        Some(path),
        Filters {
            start: Some("not-a-time".to_string()),
            ..Filters::default()
        },
        OutputFormat::Ndjson,
        None,
    )
    .expect("filter");
    assert_eq!(code, 2);
}

#[test]
fn search_matches_action_substring() {
    let dir = TempDir::new().expect("temp dir");
    let path = seeded_ledger(&dir);
    let out = dir.path().join("search.ndjson");
    let code = run_search(
        Some(path.clone()),
        "REFUND",
        None,
        None,
        OutputFormat::Ndjson,
        Some(out.clone()),
    )
    .expect("search");
    assert_eq!(code, 0);
    let contents = std::fs::read_to_string(&out).expect("read");
    assert_eq!(contents.lines().count(), 2);

    let out = dir.path().join("miss.ndjson");
    run_search(
        Some(path),
        "no-such-token",
        None,
        None,
        OutputFormat::Ndjson,
        Some(out.clone()),
    )
    .expect("search");
    assert_eq!(std::fs::read_to_string(&out).expect("read").lines().count(), 0);
}

#[test]
fn receipt_extracts_decision_fields() {
    let dir = TempDir::new().expect("temp dir");
    let path = seeded_ledger(&dir);
    let request_id = request_id_of(&path);
    let out = dir.path().join("receipt.json");
    let code = receipt::run(
        Some(path),
        Some(request_id.clone()),
        None,
        Some(out.clone()),
    )
    .expect("receipt");
    assert_eq!(code, 0);

    let receipt: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).expect("read")).expect("parse");
    assert_eq!(receipt["ledger_position"], 0);
    assert_eq!(receipt["request_id"], request_id.as_str());
    assert_eq!(receipt["schema_version"], "2.0");
    assert!(receipt["entry_hash"].is_string());
    assert!(receipt["decision_hash"].is_string());
}

#[test]
fn receipt_requires_exactly_one_selector() {
    let dir = TempDir::new().expect("temp dir");
    let path = seeded_ledger(&dir);
    let code = receipt::run(Some(path.clone()), None, None, None).expect("receipt");
    assert_eq!(code, 2);
    let code = receipt::run(
        Some(path),
        Some("a".to_string()),
        Some("b".to_string()),
        None,
    )
    .expect("receipt");
    assert_eq!(code, 2);
}

#[test]
fn keygen_then_keyed_verification() {
    let dir = TempDir::new().expect("temp dir");
    let private_key = dir.path().join("ledger.key");
    let public_key = dir.path().join("ledger.pub");
    let code = keygen::run(&private_key, &public_key, false).expect("keygen");
    assert_eq!(code, 0);
    // Re-running without --overwrite refuses.
    let code = keygen::run(&private_key, &public_key, false).expect("keygen");
    assert_eq!(code, 1);

    let path = dir.path().join("signed.jsonl");
    let signing_key = toolgate_core::crypto::load_signing_key(&private_key).expect("load key");
    let engine = Engine::builder()
        .policy(Arc::new(AllowAll))
        .ledger(Arc::new(JsonlLedger::with_signing_key(&path, signing_key)))
        .agent_id("agent-1")
        .build()
        .expect("engine");
    let engine = BlockingEngine::new(engine).expect("runtime");
    engine
        .execute(
            "billing.refund",
            CallArgs::new().kwarg("amount", 10i64),
            CallOptions::default(),
            || Ok::<_, std::io::Error>(()),
        )
        .expect("guarded call");

    let code = verify::run(Some(path), true, Some(public_key)).expect("verify");
    assert_eq!(code, 0);
}
