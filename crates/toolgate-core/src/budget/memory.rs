//! In-process budget manager with windowed counters.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable; lock().unwrap() is deliberate throughout.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::BoxFuture;

use super::{
    BudgetCheck, BudgetCommit, BudgetError, BudgetLimits, BudgetManager, BudgetScope,
    validate_cost,
};

#[derive(Debug, Clone)]
struct Reservation {
    check_id: String,
    agent: String,
    tool: String,
    cost: i64,
    checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Charge {
    check_id: String,
    commit_id: String,
    agent: String,
    tool: String,
    cost: i64,
    committed_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, Reservation>,
    committed: HashMap<String, Charge>,
}

/// Budget manager keeping counters in process memory.
///
/// Same contract as [`super::SqliteBudgetManager`], no durability: counters
/// reset when the process exits.
pub struct MemoryBudgetManager {
    limits: BudgetLimits,
    state: Mutex<State>,
}

impl MemoryBudgetManager {
    /// Creates a manager with the given limits.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::State`] for negative limits or a zero window.
    pub fn new(limits: BudgetLimits) -> Result<Self, BudgetError> {
        limits.validate()?;
        Ok(Self {
            limits,
            state: Mutex::new(State::default()),
        })
    }

    /// Total committed cost currently inside the window for an agent.
    ///
    /// Exposed for tests and operational introspection.
    #[must_use]
    pub fn committed_agent_usage(&self, agent: &str) -> i64 {
        let now = Utc::now();
        let cutoff = now - self.limits.window();
        let state = self.state.lock().unwrap();
        state
            .committed
            .values()
            .filter(|charge| charge.agent == agent && charge.committed_at >= cutoff)
            .map(|charge| charge.cost)
            .sum()
    }

    fn check_sync(
        &self,
        request_id: &str,
        agent: &str,
        tool: &str,
        cost: i64,
    ) -> Result<BudgetCheck, BudgetError> {
        validate_cost(cost)?;
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        prune(&mut state, now, &self.limits);

        // Idempotent replay: a known request returns its reservation.
        if let Some(charge) = state.committed.get(request_id) {
            return Ok(self.check_record(request_id, charge.check_id.clone(), charge.cost, now));
        }
        if let Some(reservation) = state.pending.get(request_id) {
            return Ok(self.check_record(
                request_id,
                reservation.check_id.clone(),
                reservation.cost,
                reservation.checked_at,
            ));
        }

        let cutoff = now - self.limits.window();
        let usage = |select: &dyn Fn(&str, &str) -> bool| -> i64 {
            let committed: i64 = state
                .committed
                .values()
                .filter(|c| c.committed_at >= cutoff && select(&c.agent, &c.tool))
                .map(|c| c.cost)
                .sum();
            let pending: i64 = state
                .pending
                .values()
                .filter(|p| p.checked_at >= cutoff && select(&p.agent, &p.tool))
                .map(|p| p.cost)
                .sum();
            committed + pending
        };
        let agent_usage = usage(&|a, _| a == agent);
        let tool_usage = usage(&|_, t| t == tool);
        enforce_limits(&self.limits, agent_usage, tool_usage, cost)?;

        let check_id = Uuid::new_v4().to_string();
        state.pending.insert(
            request_id.to_string(),
            Reservation {
                check_id: check_id.clone(),
                agent: agent.to_string(),
                tool: tool.to_string(),
                cost,
                checked_at: now,
            },
        );
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

    fn check_record(
        &self,
        request_id: &str,
        check_id: String,
        cost: i64,
        checked_at: DateTime<Utc>,
    ) -> BudgetCheck {
        BudgetCheck {
            check_id,
            request_id: request_id.to_string(),
            limit: self.limits.agent_limit.or(self.limits.tool_limit),
            projected_cost: cost,
            currency: self.limits.currency.clone(),
            succeeded: true,
            checked_at,
        }
    }

    fn commit_sync(
        &self,
        request_id: &str,
        commit_id: &str,
        actual_cost: i64,
    ) -> Result<BudgetCommit, BudgetError> {
        validate_cost(actual_cost)?;
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        prune(&mut state, now, &self.limits);

        if let Some(charge) = state.committed.get(request_id) {
            if charge.commit_id == commit_id {
                return Ok(commit_record(&self.limits, request_id, charge));
            }
            return Err(BudgetError::CommitMismatch {
                request_id: request_id.to_string(),
            });
        }

        let Some(reservation) = state.pending.remove(request_id) else {
            return Err(BudgetError::State {
                message: "pending check not found for commit".to_string(),
            });
        };
        let charge = Charge {
            check_id: reservation.check_id,
            commit_id: commit_id.to_string(),
            agent: reservation.agent,
            tool: reservation.tool,
            cost: actual_cost,
            committed_at: now,
        };
        let record = commit_record(&self.limits, request_id, &charge);
        state.committed.insert(request_id.to_string(), charge);
        Ok(record)
    }
}

fn commit_record(limits: &BudgetLimits, request_id: &str, charge: &Charge) -> BudgetCommit {
    BudgetCommit {
        check_id: charge.check_id.clone(),
        commit_id: charge.commit_id.clone(),
        request_id: request_id.to_string(),
        actual_cost: charge.cost,
        currency: limits.currency.clone(),
        committed_at: charge.committed_at,
    }
}

fn enforce_limits(
    limits: &BudgetLimits,
    agent_usage: i64,
    tool_usage: i64,
    cost: i64,
) -> Result<(), BudgetError> {
    if let Some(limit) = limits.agent_limit {
        if agent_usage + cost > limit {
            return Err(BudgetError::Exceeded {
                scope: BudgetScope::Agent,
            });
        }
    }
    if let Some(limit) = limits.tool_limit {
        if tool_usage + cost > limit {
            return Err(BudgetError::Exceeded {
                scope: BudgetScope::Tool,
            });
        }
    }
    Ok(())
}

fn prune(state: &mut State, now: DateTime<Utc>, limits: &BudgetLimits) {
    let cutoff = now - limits.window();
    state.committed.retain(|_, charge| charge.committed_at >= cutoff);
    // Stale reservations linger one extra window before the sweep.
    let stale_cutoff = now - limits.window() - limits.window();
    state
        .pending
        .retain(|_, reservation| reservation.checked_at >= stale_cutoff);
}

impl BudgetManager for MemoryBudgetManager {
    fn check<'a>(
        &'a self,
        request_id: &'a str,
        agent: &'a str,
        tool: &'a str,
        cost: i64,
    ) -> BoxFuture<'a, Result<BudgetCheck, BudgetError>> {
        Box::pin(async move { self.check_sync(request_id, agent, tool, cost) })
    }

    fn commit<'a>(
        &'a self,
        request_id: &'a str,
        commit_id: &'a str,
        actual_cost: i64,
    ) -> BoxFuture<'a, Result<BudgetCommit, BudgetError>> {
        Box::pin(async move { self.commit_sync(request_id, commit_id, actual_cost) })
    }
}
