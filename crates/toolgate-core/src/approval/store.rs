//! Approval store implementations.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable; lock().unwrap() is deliberate throughout.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use crate::BoxFuture;
use crate::canonical::format_timestamp;

use super::{
    ApprovalBinding, ApprovalRecord, ApprovalState, ApprovalStore, ApprovalStoreError,
    cap_expires_at,
};

fn validate_binding(binding: &ApprovalBinding) -> Result<(), ApprovalStoreError> {
    for (name, value) in [
        ("request_id", &binding.request_id),
        ("policy_hash", &binding.policy_hash),
        ("decision_hash", &binding.decision_hash),
    ] {
        if value.trim().is_empty() {
            return Err(ApprovalStoreError::State {
                message: format!("{name} must be a non-empty string"),
            });
        }
    }
    Ok(())
}

fn validate_terminal(state: ApprovalState) -> Result<(), ApprovalStoreError> {
    if state == ApprovalState::Pending {
        return Err(ApprovalStoreError::State {
            message: "cannot resolve to pending".to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Approval store held in process memory.
///
/// Same contract as [`SqliteApprovalStore`] without durability; pendings do
/// not survive a restart.
#[derive(Default)]
pub struct MemoryApprovalStore {
    records: Mutex<HashMap<String, ApprovalRecord>>,
}

impl MemoryApprovalStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn create_pending_sync(
        &self,
        binding: &ApprovalBinding,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), ApprovalStoreError> {
        validate_binding(binding)?;
        let now = Utc::now();
        let expires_at = cap_expires_at(expires_at, now);
        let mut records = self.records.lock().unwrap();
        expire_stale_map(&mut records, now);

        if let Some(existing) = records.get_mut(&binding.request_id) {
            if existing.state != ApprovalState::Pending {
                return Ok(());
            }
            if existing.binding != *binding {
                return Err(ApprovalStoreError::BindingMismatch {
                    request_id: binding.request_id.clone(),
                });
            }
            existing.expires_at = Some(expires_at);
            return Ok(());
        }

        records.insert(
            binding.request_id.clone(),
            ApprovalRecord {
                approval_id: Uuid::new_v4().to_string(),
                binding: binding.clone(),
                state: ApprovalState::Pending,
                approver_id: None,
                created_at: now,
                resolved_at: None,
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    fn resolve_sync(
        &self,
        request_id: &str,
        state: ApprovalState,
        approver_id: Option<&str>,
    ) -> Result<(), ApprovalStoreError> {
        validate_terminal(state)?;
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(request_id) else {
            return Err(ApprovalStoreError::NotFound {
                request_id: request_id.to_string(),
            });
        };
        if record.state == ApprovalState::Pending {
            record.state = state;
            record.approver_id = approver_id.map(str::to_string);
            record.resolved_at = Some(now);
            return Ok(());
        }
        if record.state == state {
            return Ok(());
        }
        Err(ApprovalStoreError::InvalidTransition {
            from: record.state,
            to: state,
        })
    }

    fn fetch_sync(&self, request_id: &str) -> Option<ApprovalRecord> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(request_id)?;
        lazily_expire(record, now);
        Some(record.clone())
    }

    fn expire_stale_sync(&self) -> u64 {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        expire_stale_map(&mut records, now)
    }
}

fn lazily_expire(record: &mut ApprovalRecord, now: DateTime<Utc>) {
    if record.state == ApprovalState::Pending {
        if let Some(expires_at) = record.expires_at {
            if expires_at < now {
                record.state = ApprovalState::Expired;
                record.resolved_at = Some(now);
            }
        }
    }
}

fn expire_stale_map(records: &mut HashMap<String, ApprovalRecord>, now: DateTime<Utc>) -> u64 {
    let mut expired = 0;
    for record in records.values_mut() {
        let before = record.state;
        lazily_expire(record, now);
        if before == ApprovalState::Pending && record.state == ApprovalState::Expired {
            expired += 1;
        }
    }
    expired
}

impl ApprovalStore for MemoryApprovalStore {
    fn create_pending<'a>(
        &'a self,
        binding: &'a ApprovalBinding,
        expires_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<(), ApprovalStoreError>> {
        Box::pin(async move { self.create_pending_sync(binding, expires_at) })
    }

    fn resolve<'a>(
        &'a self,
        request_id: &'a str,
        state: ApprovalState,
        approver_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ApprovalStoreError>> {
        Box::pin(async move { self.resolve_sync(request_id, state, approver_id) })
    }

    fn fetch<'a>(
        &'a self,
        request_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ApprovalRecord>, ApprovalStoreError>> {
        Box::pin(async move { Ok(self.fetch_sync(request_id)) })
    }

    fn expire_stale(&self) -> BoxFuture<'_, Result<u64, ApprovalStoreError>> {
        Box::pin(async move { Ok(self.expire_stale_sync()) })
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// `SQLite`-backed approval store.
///
/// Pending approvals survive process restarts and are visible to other
/// processes sharing the database, which is what lets an external approver
/// resolve them out of band.
#[derive(Clone)]
pub struct SqliteApprovalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteApprovalStore {
    /// Opens or creates the approval database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ApprovalStoreError> {
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
        })
    }

    fn create_pending_blocking(
        &self,
        binding: &ApprovalBinding,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), ApprovalStoreError> {
        validate_binding(binding)?;
        let now = Utc::now();
        let expires_at = cap_expires_at(expires_at, now);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        expire_stale_tx(&tx, now)?;

        let existing: Option<(String, String, String)> = tx
            .query_row(
                "SELECT policy_hash, decision_hash, state FROM approvals WHERE request_id = ?1",
                params![binding.request_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((policy_hash, decision_hash, state)) = existing {
            if state != "pending" {
                tx.commit()?;
                return Ok(());
            }
            if policy_hash != binding.policy_hash || decision_hash != binding.decision_hash {
                return Err(ApprovalStoreError::BindingMismatch {
                    request_id: binding.request_id.clone(),
                });
            }
            tx.execute(
                "UPDATE approvals SET expires_at = ?1 WHERE request_id = ?2 AND state = 'pending'",
                params![format_timestamp(expires_at), binding.request_id],
            )?;
            tx.commit()?;
            return Ok(());
        }

        tx.execute(
            "INSERT INTO approvals
             (request_id, approval_id, policy_hash, decision_hash, state, approver_id, expires_at, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', NULL, ?5, ?6, NULL)",
            params![
                binding.request_id,
                Uuid::new_v4().to_string(),
                binding.policy_hash,
                binding.decision_hash,
                format_timestamp(expires_at),
                format_timestamp(now),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn resolve_blocking(
        &self,
        request_id: &str,
        state: ApprovalState,
        approver_id: Option<&str>,
    ) -> Result<(), ApprovalStoreError> {
        validate_terminal(state)?;
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE approvals SET state = ?1, approver_id = ?2, resolved_at = ?3
             WHERE request_id = ?4 AND state = 'pending'",
            params![
                state.as_str(),
                approver_id,
                format_timestamp(now),
                request_id
            ],
        )?;
        if changed == 0 {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT state FROM approvals WHERE request_id = ?1",
                    params![request_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(existing) = existing else {
                return Err(ApprovalStoreError::NotFound {
                    request_id: request_id.to_string(),
                });
            };
            if existing != state.as_str() {
                let from = ApprovalState::parse(&existing).unwrap_or(ApprovalState::Failed);
                return Err(ApprovalStoreError::InvalidTransition { from, to: state });
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn fetch_blocking(
        &self,
        request_id: &str,
    ) -> Result<Option<ApprovalRecord>, ApprovalStoreError> {
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Lazy expiry for this record before reading it back.
        tx.execute(
            "UPDATE approvals SET state = 'expired', resolved_at = ?1
             WHERE request_id = ?2 AND state = 'pending'
               AND expires_at IS NOT NULL AND expires_at < ?1",
            params![format_timestamp(now), request_id],
        )?;
        let record = tx
            .query_row(
                "SELECT approval_id, policy_hash, decision_hash, state, approver_id,
                        expires_at, created_at, resolved_at
                 FROM approvals WHERE request_id = ?1",
                params![request_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;
        tx.commit()?;

        let Some((
            approval_id,
            policy_hash,
            decision_hash,
            state,
            approver_id,
            expires_at,
            created_at,
            resolved_at,
        )) = record
        else {
            return Ok(None);
        };
        let state = ApprovalState::parse(&state).ok_or_else(|| ApprovalStoreError::State {
            message: format!("stored state invalid: {state}"),
        })?;
        Ok(Some(ApprovalRecord {
            approval_id,
            binding: ApprovalBinding {
                request_id: request_id.to_string(),
                policy_hash,
                decision_hash,
            },
            state,
            approver_id,
            created_at: parse_timestamp(&created_at)?,
            resolved_at: resolved_at.as_deref().map(parse_timestamp).transpose()?,
            expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
        }))
    }

    fn expire_stale_blocking(&self) -> Result<u64, ApprovalStoreError> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        expire_stale_tx(&conn, now)
    }
}

fn expire_stale_tx(conn: &Connection, now: DateTime<Utc>) -> Result<u64, ApprovalStoreError> {
    let changed = conn.execute(
        "UPDATE approvals SET state = 'expired', resolved_at = ?1
         WHERE state = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
        params![format_timestamp(now)],
    )?;
    Ok(changed as u64)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ApprovalStoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| ApprovalStoreError::State {
            message: format!("stored timestamp invalid: {err}"),
        })
}

impl ApprovalStore for SqliteApprovalStore {
    fn create_pending<'a>(
        &'a self,
        binding: &'a ApprovalBinding,
        expires_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<(), ApprovalStoreError>> {
        let store = self.clone();
        let binding = binding.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || store.create_pending_blocking(&binding, expires_at))
                .await
                .map_err(|err| ApprovalStoreError::TaskFailed {
                    message: err.to_string(),
                })?
        })
    }

    fn resolve<'a>(
        &'a self,
        request_id: &'a str,
        state: ApprovalState,
        approver_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ApprovalStoreError>> {
        let store = self.clone();
        let request_id = request_id.to_string();
        let approver_id = approver_id.map(str::to_string);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                store.resolve_blocking(&request_id, state, approver_id.as_deref())
            })
            .await
            .map_err(|err| ApprovalStoreError::TaskFailed {
                message: err.to_string(),
            })?
        })
    }

    fn fetch<'a>(
        &'a self,
        request_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ApprovalRecord>, ApprovalStoreError>> {
        let store = self.clone();
        let request_id = request_id.to_string();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || store.fetch_blocking(&request_id))
                .await
                .map_err(|err| ApprovalStoreError::TaskFailed {
                    message: err.to_string(),
                })?
        })
    }

    fn expire_stale(&self) -> BoxFuture<'_, Result<u64, ApprovalStoreError>> {
        let store = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || store.expire_stale_blocking())
                .await
                .map_err(|err| ApprovalStoreError::TaskFailed {
                    message: err.to_string(),
                })?
        })
    }
}
