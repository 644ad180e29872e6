//! Two-phase budget accounting with idempotent check/commit.
//!
//! Budgets are windowed usage counters with optional per-agent and per-tool
//! limits. A guarded call first `check`s (tentative reservation, fail-closed
//! when the projected total crosses a limit), then `commit`s after the
//! outcome is recorded. Both phases carry idempotency keys so retries and
//! restarts never double-charge:
//!
//! - `check` is idempotent by `request_id`: a repeated check returns the
//!   existing reservation's `check_id` and leaves counters untouched.
//! - `commit` is idempotent by `(request_id, commit_id)`: a replay with the
//!   same pair is a no-op; a replay with a different `commit_id` against an
//!   already-committed request is rejected.
//!
//! [`MemoryBudgetManager`] and [`SqliteBudgetManager`] share this contract;
//! only durability differs.

mod memory;
mod sqlite;


use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::MemoryBudgetManager;
pub use sqlite::SqliteBudgetManager;

use crate::BoxFuture;
use crate::policy::{BUDGET_EXCEEDED_AGENT_RATE, BUDGET_EXCEEDED_TOOL_RATE};

/// Default accounting window when none is configured.
pub const DEFAULT_WINDOW_SECONDS: u64 = 3600;

/// Ceiling on configurable windows (one year).
pub const MAX_WINDOW_SECONDS: u64 = 31_536_000;

/// Currency label stamped on check/commit records.
pub const DEFAULT_CURRENCY: &str = "units";

/// Which limit a rejected check crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetScope {
    /// Per-agent window limit.
    Agent,
    /// Per-tool window limit.
    Tool,
}

impl BudgetScope {
    /// Reason code recorded for a denial in this scope.
    #[must_use]
    pub const fn reason_code(self) -> &'static str {
        match self {
            Self::Agent => BUDGET_EXCEEDED_AGENT_RATE,
            Self::Tool => BUDGET_EXCEEDED_TOOL_RATE,
        }
    }
}

/// Errors from budget operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BudgetError {
    /// The projected post-check total crosses a configured limit.
    #[error("budget exceeded for {scope:?} window")]
    Exceeded {
        /// The limit that was crossed.
        scope: BudgetScope,
    },

    /// A commit replay carried a different `commit_id`.
    #[error("commit replay with mismatched commit_id for request {request_id}")]
    CommitMismatch {
        /// The request whose commit was replayed.
        request_id: String,
    },

    /// Invalid input or missing reservation state.
    #[error("budget state error: {message}")]
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
    #[error("budget task failed: {message}")]
    TaskFailed {
        /// Description of the task failure.
        message: String,
    },
}

/// Result of a successful budget check.
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    /// Reservation id; stable across idempotent re-checks.
    pub check_id: String,
    /// The request this reservation belongs to.
    pub request_id: String,
    /// The tightest limit considered, if any is configured.
    pub limit: Option<i64>,
    /// Projected window total had the reservation been fresh.
    pub projected_cost: i64,
    /// Accounting currency label.
    pub currency: String,
    /// Always true on the `Ok` path; denials are errors.
    pub succeeded: bool,
    /// When the reservation was (first) taken.
    pub checked_at: DateTime<Utc>,
}

/// Result of a successful budget commit.
#[derive(Debug, Clone)]
pub struct BudgetCommit {
    /// The reservation that was finalized.
    pub check_id: String,
    /// Commit idempotency key.
    pub commit_id: String,
    /// The request this charge belongs to.
    pub request_id: String,
    /// Final charged cost.
    pub actual_cost: i64,
    /// Accounting currency label.
    pub currency: String,
    /// When the charge was (first) committed.
    pub committed_at: DateTime<Utc>,
}

/// Limits and window shared by both implementations.
#[derive(Debug, Clone)]
pub struct BudgetLimits {
    /// Maximum committed+pending cost per agent inside the window.
    pub agent_limit: Option<i64>,
    /// Maximum committed+pending cost per tool inside the window.
    pub tool_limit: Option<i64>,
    /// Accounting window in seconds.
    pub window_seconds: u64,
    /// Currency label for records.
    pub currency: String,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            agent_limit: None,
            tool_limit: None,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }
}

impl BudgetLimits {
    pub(crate) fn validate(&self) -> Result<(), BudgetError> {
        if self.agent_limit.is_some_and(|limit| limit < 0) {
            return Err(BudgetError::State {
                message: "agent_limit must be non-negative".to_string(),
            });
        }
        if self.tool_limit.is_some_and(|limit| limit < 0) {
            return Err(BudgetError::State {
                message: "tool_limit must be non-negative".to_string(),
            });
        }
        if self.window_seconds == 0 {
            return Err(BudgetError::State {
                message: "window_seconds must be positive".to_string(),
            });
        }
        if self.window_seconds > MAX_WINDOW_SECONDS {
            return Err(BudgetError::State {
                message: format!("window_seconds must be at most {MAX_WINDOW_SECONDS}"),
            });
        }
        Ok(())
    }

    pub(crate) fn window(&self) -> chrono::Duration {
        let seconds = i64::try_from(self.window_seconds).unwrap_or(i64::MAX / 1_000);
        chrono::Duration::seconds(seconds.min(i64::MAX / 1_000))
    }
}

pub(crate) fn validate_cost(cost: i64) -> Result<(), BudgetError> {
    if cost < 0 {
        return Err(BudgetError::State {
            message: "cost must be non-negative".to_string(),
        });
    }
    Ok(())
}

/// Object-safe async contract for budget accounting.
pub trait BudgetManager: Send + Sync {
    /// Reserves `cost` for a request; idempotent by `request_id`.
    ///
    /// Fails with [`BudgetError::Exceeded`] when a limit would be crossed.
    fn check<'a>(
        &'a self,
        request_id: &'a str,
        agent: &'a str,
        tool: &'a str,
        cost: i64,
    ) -> BoxFuture<'a, Result<BudgetCheck, BudgetError>>;

    /// Finalizes a reservation; idempotent by `(request_id, commit_id)`.
    fn commit<'a>(
        &'a self,
        request_id: &'a str,
        commit_id: &'a str,
        actual_cost: i64,
    ) -> BoxFuture<'a, Result<BudgetCommit, BudgetError>>;
}
