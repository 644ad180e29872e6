//! Durable budget manager backed by `SQLite`.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable; lock().unwrap() is deliberate throughout.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use crate::BoxFuture;

use super::{
    BudgetCheck, BudgetCommit, BudgetError, BudgetLimits, BudgetManager, BudgetScope,
    validate_cost,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Budget manager persisting reservations and charges to `SQLite`.
///
/// Runs in WAL mode with `synchronous=FULL`. Check and commit each run in a
/// `BEGIN IMMEDIATE` transaction, so retries after a crash observe the
/// prior reservation and stay idempotent.
#[derive(Clone)]
pub struct SqliteBudgetManager {
    conn: Arc<Mutex<Connection>>,
    limits: BudgetLimits,
}

impl SqliteBudgetManager {
    /// Opens or creates the budget database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid limits or database failures.
    pub fn open(path: impl AsRef<Path>, limits: BudgetLimits) -> Result<Self, BudgetError> {
        limits.validate()?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            limits,
        })
    }

    fn check_blocking(
        &self,
        request_id: &str,
        agent: &str,
        tool: &str,
        cost: i64,
    ) -> Result<BudgetCheck, BudgetError> {
        validate_cost(cost)?;
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        prune(&tx, now, &self.limits)?;

        // Idempotent replay: a known request returns its reservation.
        let replay: Option<(String, i64, String)> = tx
            .query_row(
                "SELECT check_id, cost, committed_at FROM committed WHERE request_id = ?1",
                params![request_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .or(tx
                .query_row(
                    "SELECT check_id, cost, checked_at FROM pending WHERE request_id = ?1",
                    params![request_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?);
        if let Some((check_id, cost, at)) = replay {
            tx.commit()?;
            return Ok(BudgetCheck {
                check_id,
                request_id: request_id.to_string(),
                limit: self.limits.agent_limit.or(self.limits.tool_limit),
                projected_cost: cost,
                currency: self.limits.currency.clone(),
                succeeded: true,
                checked_at: parse_timestamp(&at)?,
            });
        }

        let cutoff = timestamp(now - self.limits.window());
        let agent_usage = usage(&tx, "agent", agent, &cutoff)?;
        let tool_usage = usage(&tx, "tool", tool, &cutoff)?;
        if let Some(limit) = self.limits.agent_limit {
            if agent_usage + cost > limit {
                return Err(BudgetError::Exceeded {
                    scope: BudgetScope::Agent,
                });
            }
        }
        if let Some(limit) = self.limits.tool_limit {
            if tool_usage + cost > limit {
                return Err(BudgetError::Exceeded {
                    scope: BudgetScope::Tool,
                });
            }
        }

        let check_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO pending (request_id, check_id, agent, tool, cost, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![request_id, check_id, agent, tool, cost, timestamp(now)],
        )?;
        tx.commit()?;
        Ok(BudgetCheck {
            check_id,
            request_id: request_id.to_string(),
            limit: self.limits.agent_limit.or(self.limits.tool_limit),
            projected_cost: agent_usage + cost,
            currency: self.limits.currency.clone(),
            succeeded: true,
            checked_at: now,
        })
    }

    fn commit_blocking(
        &self,
        request_id: &str,
        commit_id: &str,
        actual_cost: i64,
    ) -> Result<BudgetCommit, BudgetError> {
        validate_cost(actual_cost)?;
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        prune(&tx, now, &self.limits)?;

        let existing: Option<(String, String, i64, String)> = tx
            .query_row(
                "SELECT check_id, commit_id, cost, committed_at FROM committed WHERE request_id = ?1",
                params![request_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        if let Some((check_id, existing_commit, cost, at)) = existing {
            if existing_commit != commit_id {
                return Err(BudgetError::CommitMismatch {
                    request_id: request_id.to_string(),
                });
            }
            tx.commit()?;
            return Ok(BudgetCommit {
                check_id,
                commit_id: existing_commit,
                request_id: request_id.to_string(),
                actual_cost: cost,
                currency: self.limits.currency.clone(),
                committed_at: parse_timestamp(&at)?,
            });
        }

        let pending: Option<(String, String, String)> = tx
            .query_row(
                "SELECT check_id, agent, tool FROM pending WHERE request_id = ?1",
                params![request_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((check_id, agent, tool)) = pending else {
            return Err(BudgetError::State {
                message: "pending check not found for commit".to_string(),
            });
        };

        tx.execute(
            "INSERT INTO committed (request_id, check_id, commit_id, agent, tool, cost, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                request_id,
                check_id,
                commit_id,
                agent,
                tool,
                actual_cost,
                timestamp(now)
            ],
        )?;
        tx.execute(
            "DELETE FROM pending WHERE request_id = ?1",
            params![request_id],
        )?;
        tx.commit()?;
        Ok(BudgetCommit {
            check_id,
            commit_id: commit_id.to_string(),
            request_id: request_id.to_string(),
            actual_cost,
            currency: self.limits.currency.clone(),
            committed_at: now,
        })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    crate::canonical::format_timestamp(at)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, BudgetError> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| BudgetError::State {
            message: format!("stored timestamp invalid: {err}"),
        })
}

fn usage(
    conn: &Connection,
    key: &str,
    value: &str,
    cutoff: &str,
) -> Result<i64, BudgetError> {
    debug_assert!(key == "agent" || key == "tool");
    let committed: i64 = conn.query_row(
        &format!("SELECT COALESCE(SUM(cost), 0) FROM committed WHERE {key} = ?1 AND committed_at >= ?2"),
        params![value, cutoff],
        |row| row.get(0),
    )?;
    let pending: i64 = conn.query_row(
        &format!("SELECT COALESCE(SUM(cost), 0) FROM pending WHERE {key} = ?1 AND checked_at >= ?2"),
        params![value, cutoff],
        |row| row.get(0),
    )?;
    Ok(committed + pending)
}

fn prune(conn: &Connection, now: DateTime<Utc>, limits: &BudgetLimits) -> Result<(), BudgetError> {
    let cutoff = timestamp(now - limits.window());
    conn.execute(
        "DELETE FROM committed WHERE committed_at < ?1",
        params![cutoff],
    )?;
    let stale_cutoff = timestamp(now - limits.window() - limits.window());
    conn.execute(
        "DELETE FROM pending WHERE checked_at < ?1",
        params![stale_cutoff],
    )?;
    Ok(())
}

impl BudgetManager for SqliteBudgetManager {
    fn check<'a>(
        &'a self,
        request_id: &'a str,
        agent: &'a str,
        tool: &'a str,
        cost: i64,
    ) -> BoxFuture<'a, Result<BudgetCheck, BudgetError>> {
        let manager = self.clone();
        let (request_id, agent, tool) = (
            request_id.to_string(),
            agent.to_string(),
            tool.to_string(),
        );
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                manager.check_blocking(&request_id, &agent, &tool, cost)
            })
            .await
            .map_err(|err| BudgetError::TaskFailed {
                message: err.to_string(),
            })?
        })
    }

    fn commit<'a>(
        &'a self,
        request_id: &'a str,
        commit_id: &'a str,
        actual_cost: i64,
    ) -> BoxFuture<'a, Result<BudgetCommit, BudgetError>> {
        let manager = self.clone();
        let (request_id, commit_id) = (request_id.to_string(), commit_id.to_string());
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                manager.commit_blocking(&request_id, &commit_id, actual_cost)
            })
            .await
            .map_err(|err| BudgetError::TaskFailed {
                message: err.to_string(),
            })?
        })
    }
}
