//! `toolgate receipt` - portable proof of one recorded decision.

use std::io::Write as _;
use std::path::PathBuf;

use super::{read_entries, require_ledger_path};

/// Extracts a receipt by request id or decision hash.
pub fn run(
    ledger_path: Option<PathBuf>,
    request_id: Option<String>,
    decision_hash: Option<String>,
    output: Option<PathBuf>,
) -> anyhow::Result<u8> {
    let ledger_path = require_ledger_path(ledger_path)?;
    if !ledger_path.exists() {
        eprintln!("ledger file not found");
        return Ok(1);
    }
    if request_id.is_some() == decision_hash.is_some() {
        eprintln!("provide exactly one of --request-id or --decision-hash");
        return Ok(2);
    }

    let entries = read_entries(&ledger_path)?;
    let matched = entries.iter().enumerate().find(|(_, entry)| {
        if entry["event"].as_str() != Some("decision") {
            return false;
        }
        if let Some(request_id) = &request_id {
            return entry["request_id"].as_str() == Some(request_id.as_str());
        }
        if let Some(decision_hash) = &decision_hash {
            return entry["decision"]["decision_hash"].as_str() == Some(decision_hash.as_str());
        }
        false
    });

    let Some((position, entry)) = matched else {
        eprintln!("receipt target not found");
        return Ok(1);
    };

    let receipt = serde_json::json!({
        "ledger_position": position,
        "schema_version": entry["schema_version"],
        "ledger_version": entry["ledger_version"],
        "request_id": entry["request_id"],
        "created_at": entry["created_at"],
        "policy_id": entry["decision"]["policy_id"],
        "policy_hash": entry["decision"]["policy_hash"],
        "decision_hash": entry["decision"]["decision_hash"],
        "entry_hash": entry["entry_hash"],
        "entry_signature": entry["entry_signature"],
    });

    let line = serde_json::to_string(&receipt)?;
    match output {
        Some(path) => {
            let mut file = std::fs::File::create(path)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        None => println!("{line}"),
    }
    Ok(0)
}
