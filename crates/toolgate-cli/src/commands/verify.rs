//! `toolgate verify` - offline chain verification.

use std::path::PathBuf;

use anyhow::Context as _;
use toolgate_core::crypto::load_verifying_key;
use toolgate_core::ledger::JsonlLedger;

use super::require_ledger_path;

/// Runs verification and prints a human or JSON report.
pub fn run(
    ledger_path: Option<PathBuf>,
    json: bool,
    public_key_path: Option<PathBuf>,
) -> anyhow::Result<u8> {
    let ledger_path = require_ledger_path(ledger_path)?;
    let public_key = public_key_path
        .map(|path| {
            load_verifying_key(&path)
                .with_context(|| format!("failed to load public key {}", path.display()))
        })
        .transpose()?;

    let ledger = JsonlLedger::new(ledger_path);
    let report = ledger.verify_blocking(public_key.as_ref())?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else if report.ok {
        println!("verification ok ({} entries)", report.entries);
        if let Some(checked) = report.signatures_checked {
            println!("signatures checked: {checked}");
        }
    } else if let Some(failure) = &report.first_failure {
        eprintln!(
            "verification failed at position {}: {} ({})",
            failure.position, failure.kind, failure.detail
        );
    }

    Ok(u8::from(!report.ok))
}
