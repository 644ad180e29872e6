//! `SQLite`-backed ledger for multi-process use on one host.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable; lock().unwrap() is deliberate throughout.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};

use crate::BoxFuture;
use crate::canonical::{Map, Value};
use crate::crypto::{SigningKey, VerifyingKey};

use super::entry::prepare_entry;
use super::validation::{self, FailureKind, ParsedEntry, VerificationFailure};
use super::{Ledger, LedgerError, VerificationReport};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Per-transaction durability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// `synchronous=FULL`: every commit reaches stable storage.
    #[default]
    Full,
    /// `synchronous=NORMAL`: WAL-safe but may lose the last commits on
    /// power failure. Opt-in.
    Relaxed,
}

impl Durability {
    const fn pragma(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Relaxed => "NORMAL",
        }
    }
}

/// Append-only ledger in a single `SQLite` table.
///
/// Runs in WAL mode so verification and export never block the writer.
/// Appends run inside `BEGIN IMMEDIATE` transactions: two concurrent
/// writers serialize on the database write lock, and their commit order is
/// the chain order.
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
    signing_key: Option<SigningKey>,
}

impl SqliteLedger {
    /// Opens or creates a ledger database at `path` with full durability.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        Self::open_with(path, Durability::Full, None)
    }

    /// Opens a ledger with explicit durability and optional signing key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open_with(
        path: impl AsRef<Path>,
        durability: Durability,
        signing_key: Option<SigningKey>,
    ) -> Result<Self, LedgerError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize(&conn, durability)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            signing_key,
        })
    }

    /// Creates an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn, Durability::Full)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            signing_key: None,
        })
    }

    fn initialize(conn: &Connection, durability: Durability) -> Result<(), LedgerError> {
        conn.execute_batch(SCHEMA_SQL)?;
        conn.pragma_update(None, "synchronous", durability.pragma())?;
        Ok(())
    }

    /// Appends an entry inside an immediate transaction, blocking.
    ///
    /// # Errors
    ///
    /// Any failure rolls the transaction back; no partial entry is visible.
    pub fn append_blocking(&self, entry: Map) -> Result<String, LedgerError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let prev_hash: Option<String> = tx
            .query_row(
                "SELECT entry_hash FROM ledger ORDER BY position DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let (line, entry_hash) =
            prepare_entry(entry, prev_hash.as_deref(), self.signing_key.as_ref())?;

        // Pull denormalized columns back out of the finished line.
        let parsed = Value::from_json_str(&line)?;
        let body = parsed.as_object().ok_or_else(|| LedgerError::Corrupt {
            position: 0,
            detail: "prepared entry is not an object".to_string(),
        })?;
        let request_id = body.get("request_id").and_then(Value::as_str).unwrap_or("");
        let event = body.get("event").and_then(Value::as_str).unwrap_or("");
        let created_at = body.get("created_at").and_then(Value::as_str).unwrap_or("");
        let signature = body.get("entry_signature").and_then(Value::as_str);

        tx.execute(
            "INSERT INTO ledger (request_id, event, created_at, entry_json, entry_hash, prev_entry_hash, entry_signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![request_id, event, created_at, line, entry_hash, prev_hash, signature],
        )?;
        tx.commit()?;
        Ok(entry_hash)
    }

    /// Reads all rows after verifying the chain up front.
    ///
    /// Returns each entry with its `entry_hash` (the chain state after the
    /// entry); fails on the first verification finding.
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
        let conn = self.conn.lock().unwrap();
        let mut statement =
            conn.prepare("SELECT entry_json, entry_hash FROM ledger ORDER BY position ASC")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (entry_json, hash) = row?;
            if let Ok(Value::Object(entry)) = Value::from_json_str(&entry_json) {
                out.push((entry, hash));
            }
        }
        Ok(out)
    }

    /// Verifies all rows in position order, blocking.
    ///
    /// # Errors
    ///
    /// Returns database errors; verification findings land in the report.
    pub fn verify_blocking(
        &self,
        public_key: Option<&VerifyingKey>,
    ) -> Result<VerificationReport, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT entry_json, entry_hash, prev_entry_hash FROM ledger ORDER BY position ASC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut parsed: Vec<Result<ParsedEntry, VerificationFailure>> = Vec::new();
        for (position, row) in rows.enumerate() {
            let position = position as u64;
            match row {
                Ok((entry_json, row_entry_hash, row_prev_hash)) => {
                    parsed.push(parse_row(
                        &entry_json,
                        position,
                        row_entry_hash,
                        row_prev_hash,
                    ));
                }
                Err(err) => {
                    parsed.push(Err(VerificationFailure::new(
                        position,
                        FailureKind::CanonicalForm,
                        err.to_string(),
                    )));
                    break;
                }
            }
        }
        Ok(validation::validate_entries(parsed, public_key))
    }
}

fn parse_row(
    entry_json: &str,
    position: u64,
    row_entry_hash: String,
    row_prev_hash: Option<String>,
) -> Result<ParsedEntry, VerificationFailure> {
    let value = Value::from_json_str(entry_json).map_err(|err| {
        VerificationFailure::new(position, FailureKind::CanonicalForm, err.to_string())
    })?;
    let Value::Object(entry) = value else {
        return Err(VerificationFailure::new(
            position,
            FailureKind::CanonicalForm,
            "row body is not an object",
        ));
    };
    Ok(ParsedEntry {
        entry,
        raw: entry_json.to_string(),
        position,
        row_entry_hash: Some(row_entry_hash),
        row_prev_hash,
    })
}

impl Ledger for SqliteLedger {
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
