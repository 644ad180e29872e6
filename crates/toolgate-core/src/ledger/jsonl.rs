//! Line-oriented ledger backend with advisory file locking.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::BoxFuture;
use crate::canonical::{Map, Value};
use crate::crypto::{SigningKey, VerifyingKey};

use super::entry::prepare_entry;
use super::validation::{self, FailureKind, ParsedEntry, VerificationFailure};
use super::{Ledger, LedgerError, VerificationReport};

/// Chunk size for reading the chain tip from the end of the file.
const TAIL_READ_CHUNK: usize = 4096;

/// Append-only JSONL ledger.
///
/// One canonical-JSON entry per LF-terminated line, UTF-8, no BOM. Appends
/// take an exclusive `flock` for the read-tip/write window and fsync before
/// releasing, so concurrent writers on one host serialize cleanly. A torn
/// trailing line (crash mid-append) is invisible to the chain: appenders
/// truncate it, and verification reports it as truncation.
#[derive(Clone)]
pub struct JsonlLedger {
    path: PathBuf,
    signing_key: Option<SigningKey>,
}

impl JsonlLedger {
    /// Creates an unsigned ledger at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            signing_key: None,
        }
    }

    /// Creates a signing ledger; every entry carries an Ed25519 signature.
    #[must_use]
    pub fn with_signing_key(path: impl Into<PathBuf>, signing_key: SigningKey) -> Self {
        Self {
            path: path.into(),
            signing_key: Some(signing_key),
        }
    }

    /// Returns the backing path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an entry, blocking until the write is durable.
    ///
    /// # Errors
    ///
    /// Any failure leaves the file without a new visible entry.
    pub fn append_blocking(&self, entry: Map) -> Result<String, LedgerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = self.append_locked(&mut file, entry);
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    fn append_locked(&self, file: &mut File, entry: Map) -> Result<String, LedgerError> {
        let tail = read_tail_state(file)?;
        if let Some(offset) = tail.truncate_to {
            tracing::warn!(path = %self.path.display(), offset, "truncating torn trailing line");
            file.set_len(offset)?;
        }
        let (line, entry_hash) =
            prepare_entry(entry, tail.last_hash.as_deref(), self.signing_key.as_ref())?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        Ok(entry_hash)
    }

    /// Reads all entries after verifying the chain up front.
    ///
    /// Returns each entry with its `entry_hash` (the chain state after the
    /// entry). Fails on the first verification finding, so callers never
    /// observe entries past a break.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Corrupt`] carrying the first failure.
    pub fn read_verified_blocking(
        &self,
        public_key: Option<&VerifyingKey>,
    ) -> Result<Vec<(Map, String)>, LedgerError> {
        let report = self.verify_blocking(public_key)?;
        if let Some(failure) = report.first_failure {
            return Err(LedgerError::Corrupt {
                position: failure.position,
                detail: format!("{}: {}", failure.kind, failure.detail),
            });
        }
        let mut out = Vec::new();
        if !self.path.exists() {
            return Ok(out);
        }
        for line in std::fs::read_to_string(&self.path)?.lines() {
            if line.is_empty() {
                continue;
            }
            let Ok(Value::Object(entry)) = Value::from_json_str(line) else {
                continue;
            };
            let hash = entry
                .get("entry_hash")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            out.push((entry, hash));
        }
        Ok(out)
    }

    /// Verifies the whole file, blocking.
    ///
    /// A missing file verifies as an empty, valid ledger.
    ///
    /// # Errors
    ///
    /// Returns I/O errors; verification findings land in the report.
    pub fn verify_blocking(
        &self,
        public_key: Option<&VerifyingKey>,
    ) -> Result<VerificationReport, LedgerError> {
        if !self.path.exists() {
            return Ok(validation::validate_entries(std::iter::empty(), public_key));
        }
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut lines: Vec<Result<ParsedEntry, VerificationFailure>> = Vec::new();
        let mut buffer = Vec::new();
        let mut position: u64 = 0;
        loop {
            buffer.clear();
            let read = reader.read_until(b'\n', &mut buffer)?;
            if read == 0 {
                break;
            }
            if buffer.last() != Some(&b'\n') {
                lines.push(Err(VerificationFailure::new(
                    position,
                    FailureKind::CanonicalForm,
                    "truncated trailing line",
                )));
                break;
            }
            buffer.pop();
            let parsed = parse_line(&buffer, position);
            lines.push(parsed);
            position += 1;
        }
        Ok(validation::validate_entries(lines, public_key))
    }
}

fn parse_line(raw: &[u8], position: u64) -> Result<ParsedEntry, VerificationFailure> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        VerificationFailure::new(position, FailureKind::CanonicalForm, "line is not UTF-8")
    })?;
    if text.is_empty() {
        return Err(VerificationFailure::new(
            position,
            FailureKind::CanonicalForm,
            "empty line",
        ));
    }
    let value = Value::from_json_str(text).map_err(|err| {
        VerificationFailure::new(position, FailureKind::CanonicalForm, err.to_string())
    })?;
    let Value::Object(entry) = value else {
        return Err(VerificationFailure::new(
            position,
            FailureKind::CanonicalForm,
            "line is not an object",
        ));
    };
    Ok(ParsedEntry {
        entry,
        raw: text.to_string(),
        position,
        row_entry_hash: None,
        row_prev_hash: None,
    })
}

impl Ledger for JsonlLedger {
    fn append(&self, entry: Map) -> BoxFuture<'_, Result<String, LedgerError>> {
        let ledger = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || ledger.append_blocking(entry))
                .await
                .map_err(|err| LedgerError::TaskFailed {
                    message: err.to_string(),
                })?
        })
    }

    fn verify(
        &self,
        public_key: Option<VerifyingKey>,
    ) -> BoxFuture<'_, Result<VerificationReport, LedgerError>> {
        let ledger = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || ledger.verify_blocking(public_key.as_ref()))
                .await
                .map_err(|err| LedgerError::TaskFailed {
                    message: err.to_string(),
                })?
        })
    }
}

struct TailState {
    /// Entry hash of the last complete line, if any.
    last_hash: Option<String>,
    /// Offset to truncate to when a torn trailing line exists.
    truncate_to: Option<u64>,
}

/// Locates the chain tip without scanning the whole file.
///
/// Reads backwards in chunks until the buffer holds the last complete line
/// in full (bounded by an earlier newline or the start of the file).
fn read_tail_state(file: &mut File) -> Result<TailState, LedgerError> {
    let size = file.seek(SeekFrom::End(0))?;
    if size == 0 {
        return Ok(TailState {
            last_hash: None,
            truncate_to: None,
        });
    }

    let mut pos = size;
    let mut data: Vec<u8> = Vec::new();
    loop {
        let newlines = data.iter().filter(|b| **b == b'\n').count();
        if newlines >= 2 || pos == 0 {
            break;
        }
        let read = TAIL_READ_CHUNK.min(usize::try_from(pos).unwrap_or(TAIL_READ_CHUNK));
        pos -= read as u64;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; read];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&data);
        data = chunk;
    }

    let torn = data.last() != Some(&b'\n');
    let last_newline = data.iter().rposition(|b| *b == b'\n');
    let truncate_to = if torn {
        Some(last_newline.map_or(pos, |idx| pos + idx as u64 + 1))
    } else {
        None
    };

    // Complete region: everything up to and including the last newline.
    let complete = match last_newline {
        Some(idx) => &data[..=idx],
        None => {
            // Whole file is one torn line (pos == 0 by loop invariant).
            return Ok(TailState {
                last_hash: None,
                truncate_to,
            });
        }
    };

    // The first segment may start mid-line when pos > 0; the loop guarantees
    // the final complete segment is bounded by an earlier newline then.
    let last_line = complete
        .split(|b| *b == b'\n')
        .filter(|segment| !segment.is_empty())
        .next_back();
    let Some(last_line) = last_line else {
        return Ok(TailState {
            last_hash: None,
            truncate_to,
        });
    };

    let text = std::str::from_utf8(last_line).map_err(|_| LedgerError::Corrupt {
        position: 0,
        detail: "tail line is not UTF-8".to_string(),
    })?;
    let value = Value::from_json_str(text).map_err(|err| LedgerError::Corrupt {
        position: 0,
        detail: format!("tail line is not valid JSON: {err}"),
    })?;
    let last_hash = value
        .as_object()
        .and_then(|entry| entry.get("entry_hash"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(last_hash) = last_hash else {
        return Err(LedgerError::Corrupt {
            position: 0,
            detail: "tail entry_hash missing or invalid".to_string(),
        });
    };
    Ok(TailState {
        last_hash: Some(last_hash),
        truncate_to,
    })
}
