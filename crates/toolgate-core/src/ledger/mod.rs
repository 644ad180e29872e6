//! Tamper-evident evidence ledger.
//!
//! The ledger is an append-only, hash-chained store of decision and outcome
//! entries. Two backends implement one contract:
//!
//! - [`JsonlLedger`]: one canonical-JSON object per line, advisory file
//!   locking, fsync per append. Single-writer per host.
//! - [`SqliteLedger`]: a single table in WAL mode with denormalized hash
//!   columns. Multi-process on one host; readers never block the writer.
//!
//! # Append contract
//!
//! The caller supplies an entry without chaining fields. Under the backend's
//! exclusive write lock, the backend reads the previous entry's hash, sets
//! `prev_entry_hash`, computes `entry_hash` over the canonical entry with
//! `entry_hash` and `entry_signature` nulled, optionally signs, and durably
//! writes. A failed append leaves nothing visible to readers.
//!
//! # Verification
//!
//! [`validation`] replays the chain offline and reports the first failure
//! with its position and kind. Verification reads only the stored bytes.

mod entry;
mod jsonl;
mod sqlite;
pub mod validation;

#[cfg(test)]
mod tests;

use thiserror::Error;

pub use entry::{compute_decision_hash, prepare_entry};
pub use jsonl::JsonlLedger;
pub use sqlite::{Durability, SqliteLedger};
pub use validation::{FailureKind, VerificationFailure, VerificationReport};

use crate::BoxFuture;
use crate::canonical::{CanonicalError, Map};
use crate::crypto::{SigningError, VerifyingKey};

/// Schema version stamped on every entry.
pub const SCHEMA_VERSION: &str = "2.0";

/// Ledger format version stamped on every entry.
pub const LEDGER_VERSION: &str = "2.0";

/// Errors from ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// I/O error against the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Entry could not be canonically encoded.
    #[error("canonical encoding failed: {0}")]
    Canonical(#[from] CanonicalError),

    /// Entry hash could not be signed.
    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),

    /// Stored bytes are not a parseable chained entry.
    #[error("corrupt ledger at position {position}: {detail}")]
    Corrupt {
        /// Zero-based entry position.
        position: u64,
        /// Description of the corruption.
        detail: String,
    },

    /// A blocking task servicing the async surface died.
    #[error("ledger task failed: {message}")]
    TaskFailed {
        /// Description of the task failure.
        message: String,
    },
}

/// Object-safe async contract shared by all ledger backends.
///
/// The engine depends only on this capability set; concrete backends are
/// injected at construction.
pub trait Ledger: Send + Sync {
    /// Appends one entry and returns its chain hash.
    ///
    /// The entry must not carry `prev_entry_hash`, `entry_hash`, or
    /// `entry_signature`; the backend owns those fields.
    fn append(&self, entry: Map) -> BoxFuture<'_, Result<String, LedgerError>>;

    /// Verifies the whole ledger, optionally checking signatures.
    fn verify(
        &self,
        public_key: Option<VerifyingKey>,
    ) -> BoxFuture<'_, Result<VerificationReport, LedgerError>>;
}
