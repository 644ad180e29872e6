//! Approval state, durable stores, and approver contract.
//!
//! An approval makes one decision executable: it is bound to the triple
//! `{request_id, policy_hash, decision_hash}` and is single-use. The engine
//! writes a pending record before yielding to the approver, awaits
//! resolution under a timeout, and rejects any response whose binding does
//! not match the decision it computed.
//!
//! Stores enforce TTLs so nothing stays pending forever: every pending
//! record expires at most [`MAX_TTL_SECONDS`] after creation, and expired
//! records are treated as denials.

mod approver;
mod store;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub use approver::{Approver, PollingApprover, StaticApprover};
pub use store::{MemoryApprovalStore, SqliteApprovalStore};

use crate::BoxFuture;

/// Default pending TTL when the caller does not specify one.
pub const DEFAULT_TTL_SECONDS: u64 = 300;

/// Hard cap on any pending TTL.
pub const MAX_TTL_SECONDS: u64 = 3600;

/// Lifecycle state of an approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    /// Awaiting resolution.
    Pending,
    /// Granted by an approver.
    Approved,
    /// Rejected by an approver.
    Denied,
    /// TTL elapsed before resolution; treated as denied.
    Expired,
    /// The approval flow itself failed.
    Failed,
}

impl ApprovalState {
    /// Wire form used in ledger entries and store rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Parses the wire form.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The triple that makes an approval specific to exactly one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalBinding {
    /// The invocation being approved.
    pub request_id: String,
    /// Hash of the policy that requested the approval.
    pub policy_hash: String,
    /// Hash of the decision payload being approved.
    pub decision_hash: String,
}

/// Durable approval record.
#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    /// Stable id of this approval.
    pub approval_id: String,
    /// Binding to the decision.
    pub binding: ApprovalBinding,
    /// Current state.
    pub state: ApprovalState,
    /// Who resolved it, when known.
    pub approver_id: Option<String>,
    /// When the pending record was created.
    pub created_at: DateTime<Utc>,
    /// When it left the pending state.
    pub resolved_at: Option<DateTime<Utc>>,
    /// When the pending record expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRecord {
    /// True only for records resolved as approved.
    #[must_use]
    pub const fn approved(&self) -> bool {
        matches!(self.state, ApprovalState::Approved)
    }
}

/// Errors from approval-store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApprovalStoreError {
    /// No record for the request.
    #[error("approval not found: {request_id}")]
    NotFound {
        /// The unknown request id.
        request_id: String,
    },

    /// A resolved record cannot transition again.
    #[error("invalid approval state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: ApprovalState,
        /// Requested state.
        to: ApprovalState,
    },

    /// An existing pending record carries a different binding.
    #[error("binding mismatch for existing pending approval: {request_id}")]
    BindingMismatch {
        /// The conflicting request id.
        request_id: String,
    },

    /// Invalid input.
    #[error("approval state error: {message}")]
    State {
        /// Description of the failure.
        message: String,
    },

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error against the backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking task servicing the async surface died.
    #[error("approval task failed: {message}")]
    TaskFailed {
        /// Description of the task failure.
        message: String,
    },
}

/// Caps an expiry request to the store's hard TTL ceiling.
#[must_use]
pub fn cap_expires_at(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let default_ttl = Duration::seconds(DEFAULT_TTL_SECONDS as i64);
    let max_expiry = now + Duration::seconds(MAX_TTL_SECONDS as i64);
    match expires_at {
        None => now + default_ttl,
        Some(at) if at > max_expiry => max_expiry,
        Some(at) => at,
    }
}

/// Object-safe async contract for durable approval state.
///
/// Stores own their synchronization; the engine and approvers may call them
/// concurrently.
pub trait ApprovalStore: Send + Sync {
    /// Creates a pending record before the approver is consulted.
    ///
    /// Idempotent for a still-pending request with the same binding; a
    /// binding conflict is an error; an already-resolved request is left
    /// untouched.
    fn create_pending<'a>(
        &'a self,
        binding: &'a ApprovalBinding,
        expires_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<(), ApprovalStoreError>>;

    /// Atomically transitions a pending record to a terminal state.
    ///
    /// Re-resolving to the same terminal state is a no-op; any other
    /// transition from a terminal state is an error.
    fn resolve<'a>(
        &'a self,
        request_id: &'a str,
        state: ApprovalState,
        approver_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ApprovalStoreError>>;

    /// Fetches a record, lazily expiring a stale pending one.
    fn fetch<'a>(
        &'a self,
        request_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ApprovalRecord>, ApprovalStoreError>>;

    /// Expires all stale pending records; returns how many changed.
    fn expire_stale(&self) -> BoxFuture<'_, Result<u64, ApprovalStoreError>>;
}

/// Outcome reported by an approver.
#[derive(Debug, Clone)]
pub enum ApprovalResponse {
    /// Bare verdict; the engine applies its expected binding.
    Verdict(bool),
    /// Verdict with attribution and an explicit binding echo.
    Detailed {
        /// Whether the call was approved.
        approved: bool,
        /// Resolver identity, when known.
        approver_id: Option<String>,
        /// Binding echoed by the approval channel; must match the
        /// engine's expected triple or the call is denied.
        binding: Option<ApprovalBinding>,
    },
}

/// Error from a failing approver.
#[derive(Debug, Error)]
#[error("approval process failed: {message}")]
pub struct ApproverError {
    /// Description of the failure.
    pub message: String,
}

impl ApproverError {
    /// Builds an error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
