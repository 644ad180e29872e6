//! `toolgate export` / `filter` / `search` - read-side ledger queries.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;

use super::{read_entries, require_ledger_path};

/// Flattened columns emitted by the CSV writer.
const CSV_FIELDS: &[&str] = &[
    "created_at",
    "event",
    "action",
    "request_id",
    "agent_id",
    "decision_hash",
    "policy_id",
    "policy_hash",
    "decision_effect",
    "outcome_status",
    "reason",
    "reason_code",
];

/// Output encodings shared by the read-side commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One JSON array.
    Json,
    /// One JSON object per line.
    Ndjson,
    /// Flattened CSV.
    Csv,
}

/// Identity/time filters for `toolgate filter`.
#[derive(Debug, Default)]
pub struct Filters {
    pub request_id: Option<String>,
    pub action: Option<String>,
    pub agent_id: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Exports every entry.
pub fn run_export(
    ledger_path: Option<PathBuf>,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> anyhow::Result<u8> {
    let ledger_path = require_ledger_path(ledger_path)?;
    if !ledger_path.exists() {
        eprintln!("ledger file not found");
        return Ok(1);
    }
    let entries = read_entries(&ledger_path)?;
    write_entries(&entries, format, output)?;
    Ok(0)
}

/// Exports entries matching the filters.
pub fn run_filter(
    ledger_path: Option<PathBuf>,
    filters: Filters,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> anyhow::Result<u8> {
    let ledger_path = require_ledger_path(ledger_path)?;
    if !ledger_path.exists() {
        eprintln!("ledger file not found");
        return Ok(1);
    }
    let Some(range) = parse_range(filters.start.as_deref(), filters.end.as_deref()) else {
        return Ok(2);
    };

    let entries = read_entries(&ledger_path)?;
    let matched: Vec<serde_json::Value> = entries
        .into_iter()
        .filter(|entry| {
            matches_identity(entry, &filters) && matches_range(entry, range.0, range.1)
        })
        .collect();
    write_entries(&matched, format, output)?;
    Ok(0)
}

/// Exports entries whose identity fields contain the query.
pub fn run_search(
    ledger_path: Option<PathBuf>,
    query: &str,
    start: Option<String>,
    end: Option<String>,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> anyhow::Result<u8> {
    let ledger_path = require_ledger_path(ledger_path)?;
    if !ledger_path.exists() {
        eprintln!("ledger file not found");
        return Ok(1);
    }
    let Some(range) = parse_range(start.as_deref(), end.as_deref()) else {
        return Ok(2);
    };

    let needle = query.to_lowercase();
    let entries = read_entries(&ledger_path)?;
    let matched: Vec<serde_json::Value> = entries
        .into_iter()
        .filter(|entry| {
            ["request_id", "action", "agent_id"].iter().any(|key| {
                entry[*key]
                    .as_str()
                    .is_some_and(|value| value.to_lowercase().contains(&needle))
            }) && matches_range(entry, range.0, range.1)
        })
        .collect();
    write_entries(&matched, format, output)?;
    Ok(0)
}

type Range = (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

/// Parses and sanity-checks the time range; `None` means invalid input
/// (reported to stderr, exit code 2).
fn parse_range(start: Option<&str>, end: Option<&str>) -> Option<Range> {
    let start_at = match start {
        Some(text) => match parse_timestamp(text) {
            Some(at) => Some(at),
            None => {
                eprintln!("invalid --start timestamp");
                return None;
            }
        },
        None => None,
    };
    let end_at = match end {
        Some(text) => match parse_timestamp(text) {
            Some(at) => Some(at),
            None => {
                eprintln!("invalid --end timestamp");
                return None;
            }
        },
        None => None,
    };
    if let (Some(start_at), Some(end_at)) = (start_at, end_at) {
        if start_at > end_at {
            eprintln!("--start must be <= --end");
            return None;
        }
    }
    Some((start_at, end_at))
}

/// Accepts RFC 3339 timestamps and bare dates (UTC midnight).
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn matches_identity(entry: &serde_json::Value, filters: &Filters) -> bool {
    for (key, expected) in [
        ("request_id", &filters.request_id),
        ("action", &filters.action),
        ("agent_id", &filters.agent_id),
    ] {
        if let Some(expected) = expected {
            if entry[key].as_str() != Some(expected.as_str()) {
                return false;
            }
        }
    }
    true
}

fn matches_range(
    entry: &serde_json::Value,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> bool {
    if start.is_none() && end.is_none() {
        return true;
    }
    let Some(created_at) = entry["created_at"].as_str().and_then(parse_timestamp) else {
        return false;
    };
    if start.is_some_and(|at| created_at < at) {
        return false;
    }
    if end.is_some_and(|at| created_at > at) {
        return false;
    }
    true
}

/// Writes entries in the requested format to stdout or a file.
fn write_entries(
    entries: &[serde_json::Value],
    format: OutputFormat,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut sink: Box<dyn Write> = match output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };
    match format {
        OutputFormat::Json => {
            sink.write_all(b"[")?;
            for (index, entry) in entries.iter().enumerate() {
                if index > 0 {
                    sink.write_all(b",")?;
                }
                serde_json::to_writer(&mut sink, entry)?;
            }
            sink.write_all(b"]\n")?;
        }
        OutputFormat::Ndjson => {
            for entry in entries {
                serde_json::to_writer(&mut sink, entry)?;
                sink.write_all(b"\n")?;
            }
        }
        OutputFormat::Csv => {
            writeln!(sink, "{}", CSV_FIELDS.join(","))?;
            for entry in entries {
                let row: Vec<String> = CSV_FIELDS
                    .iter()
                    .map(|field| csv_escape(&flatten_field(entry, field)))
                    .collect();
                writeln!(sink, "{}", row.join(","))?;
            }
        }
    }
    sink.flush()?;
    Ok(())
}

fn flatten_field(entry: &serde_json::Value, field: &str) -> String {
    let value = match field {
        "decision_hash" => &entry["decision"]["decision_hash"],
        "policy_id" => &entry["decision"]["policy_id"],
        "policy_hash" => &entry["decision"]["policy_hash"],
        "decision_effect" => &entry["decision"]["effect"],
        "outcome_status" => &entry["outcome"]["status"],
        "reason" => &entry["decision"]["reason"],
        "reason_code" => &entry["decision"]["reason_code"],
        other => &entry[other],
    };
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
