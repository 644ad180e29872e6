//! Subcommand implementations.
//!
//! Commands return a process exit code: 0 on success, 1 on operational
//! failure (missing file, failed verification), 2 on invalid arguments.

pub mod export;
pub mod keygen;
pub mod receipt;
pub mod verify;

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};

/// Resolves the ledger path or explains how to supply one.
pub fn require_ledger_path(path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => bail!("no ledger path given (pass it as an argument or set TOOLGATE_LEDGER_PATH)"),
    }
}

/// Streams parsed entries from a JSONL ledger file, skipping blank lines.
pub fn read_entries(path: &Path) -> anyhow::Result<Vec<serde_json::Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ledger {}", path.display()))?;
    let mut entries = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("invalid JSON on line {}", index + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}
