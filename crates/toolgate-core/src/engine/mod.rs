//! The guarded-call engine.
//!
//! [`Engine::execute`] runs one invocation through the fail-closed state
//! machine:
//!
//! ```text
//! redact -> policy -> (approval) -> budget check -> decision append
//!        -> execute -> outcome append -> budget commit
//! ```
//!
//! Every failure before execution denies: the guarded callable is never
//! invoked under uncertainty, and the caller observes a typed error. The
//! decision append is the last step before execution, so any process able
//! to observe the guarded side effect is guaranteed an immutable, chained
//! record of its authorization. Outcome writes and the budget commit are
//! best-effort: the authoritative audit fact is the decision, and a
//! logging failure after execution must never mask the callable's result.
//!
//! Collaborators (policy, ledger, audit sink, approver, approval store,
//! budget manager) are injected as trait objects at construction; the
//! engine owns no global state and reads no environment.

mod blocking;


use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use blocking::BlockingEngine;

use crate::approval::{
    ApprovalBinding, ApprovalRecord, ApprovalResponse, ApprovalState, ApprovalStore, Approver,
    ApproverError, MAX_TTL_SECONDS,
};
use crate::audit::{AuditEntry, AuditSink};
use crate::budget::{BudgetCheck, BudgetError, BudgetManager, BudgetScope};
use crate::canonical::{CanonicalError, Map, Value, format_timestamp};
use crate::ledger::{LEDGER_VERSION, Ledger, SCHEMA_VERSION, compute_decision_hash};
use crate::policy::{
    self, Context, Decision, Policy, PolicyEvalError, PolicyResult, policy_hash,
};
use crate::redact::{redact_args, redact_map};

/// Boxed error type carried out of the guarded callable.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Ceiling applied to ledger-recorded error messages.
pub const DEFAULT_MAX_ERROR_LENGTH: usize = 200;

/// Default approval TTL when the caller does not specify one.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(300);

/// Typed errors surfaced by guarded calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Policy raised or returned an invalid result. A deny record was
    /// written before this surfaced.
    #[error(transparent)]
    Policy(#[from] PolicyEvalError),

    /// The normal "not authorized" outcome; a deny record is durable.
    #[error("denied: {reason}")]
    ApprovalDenied {
        /// Why the call was denied.
        reason: String,
    },

    /// The approver failed or timed out. Treated like denial.
    #[error(transparent)]
    Approval(#[from] ApproverError),

    /// Budget check failed or the manager was unavailable. Treated like
    /// denial.
    #[error(transparent)]
    Budget(#[from] BudgetError),

    /// The decision could not be durably recorded; execution is blocked
    /// unconditionally.
    #[error("audit log write failed ({reason_code}): {message}")]
    AuditLog {
        /// Stable taxonomy code, [`policy::LEDGER_WRITE_FAILED_DECISION`]
        /// for decision-path write failures.
        reason_code: &'static str,
        /// Description of the write failure.
        message: String,
    },

    /// The guarded callable itself failed; its outcome was recorded
    /// best-effort and the original error is carried here.
    #[error("guarded call failed: {0}")]
    Execution(#[source] BoxError),
}

/// Positional/keyword arguments and metadata for one guarded call.
///
/// Carries the ORIGINAL values; the engine redacts copies for policy and
/// ledger use and never feeds redacted data to the callable (the caller's
/// closure captures the originals).
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map,
    /// Caller metadata (correlation ids and the like).
    pub metadata: Map,
}

impl CallArgs {
    /// Empty argument set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Sets a metadata entry.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Policy to use instead of the engine default.
    pub policy_override: Option<Arc<dyn Policy>>,
    /// Cost charged against the budget; enables budget accounting for the
    /// call even when the engine default cost is unused.
    pub budget_cost: Option<i64>,
    /// TTL for the approval wait; capped at the store hard maximum.
    pub approval_ttl: Option<Duration>,
}

/// Immutable snapshot of one in-flight invocation.
///
/// Everything decision/outcome logging needs is captured up front, so all
/// records of one call agree byte-for-byte on the hashed fields.
struct CallState {
    request_id: String,
    action: String,
    ctx: Context,
    parameters: Value,
    policy_id: String,
    policy_hash: String,
    decision_time: DateTime<Utc>,
    decision_at: String,
    decision_hash: String,
    agent_id: String,
    budget_cost: i64,
    approval_ttl: Duration,
    commit_id: String,
}

impl CallState {
    fn binding(&self) -> ApprovalBinding {
        ApprovalBinding {
            request_id: self.request_id.clone(),
            policy_hash: self.policy_hash.clone(),
            decision_hash: self.decision_hash.clone(),
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    policy: Option<Arc<dyn Policy>>,
    ledger: Option<Arc<dyn Ledger>>,
    audit: Option<Arc<dyn AuditSink>>,
    approver: Option<Arc<dyn Approver>>,
    approval_store: Option<Arc<dyn ApprovalStore>>,
    budget: Option<Arc<dyn BudgetManager>>,
    agent_id: Option<String>,
    include_error_messages: bool,
    max_error_length: usize,
    default_approval_ttl: Duration,
}

impl EngineBuilder {
    /// Sets the default policy (required).
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the evidence ledger (required).
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Sets the operational audit sink.
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Sets the approver consulted for `REQUIRE_APPROVAL` decisions.
    #[must_use]
    pub fn approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Sets the durable approval store.
    #[must_use]
    pub fn approval_store(mut self, store: Arc<dyn ApprovalStore>) -> Self {
        self.approval_store = Some(store);
        self
    }

    /// Sets the budget manager.
    #[must_use]
    pub fn budget(mut self, budget: Arc<dyn BudgetManager>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Sets the agent identity recorded as actor principal (required).
    #[must_use]
    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Records raw error messages (sanitized, truncated) in outcome
    /// entries instead of error types only.
    #[must_use]
    pub fn include_error_messages(mut self, include: bool) -> Self {
        self.include_error_messages = include;
        self
    }

    /// Overrides the recorded-error length ceiling.
    #[must_use]
    pub fn max_error_length(mut self, max: usize) -> Self {
        self.max_error_length = max;
        self
    }

    /// Overrides the default approval TTL.
    #[must_use]
    pub fn default_approval_ttl(mut self, ttl: Duration) -> Self {
        self.default_approval_ttl = ttl;
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyEvalError`] when policy, ledger, or a non-empty
    /// agent id is missing.
    pub fn build(self) -> Result<Engine, PolicyEvalError> {
        let policy = self
            .policy
            .ok_or_else(|| PolicyEvalError::new("policy is required"))?;
        let ledger = self
            .ledger
            .ok_or_else(|| PolicyEvalError::new("ledger is required"))?;
        let agent_id = self
            .agent_id
            .ok_or_else(|| PolicyEvalError::new("agent_id is required"))?;
        if agent_id.trim().is_empty() {
            return Err(PolicyEvalError::new("agent_id must be a non-empty string"));
        }
        Ok(Engine {
            policy,
            ledger,
            audit: self.audit,
            approver: self.approver,
            approval_store: self.approval_store,
            budget: self.budget,
            agent_id,
            include_error_messages: self.include_error_messages,
            max_error_length: self.max_error_length,
            default_approval_ttl: self.default_approval_ttl,
            outcome_error_count: AtomicU64::new(0),
        })
    }
}

/// Async engine guarding function invocations.
pub struct Engine {
    policy: Arc<dyn Policy>,
    ledger: Arc<dyn Ledger>,
    audit: Option<Arc<dyn AuditSink>>,
    approver: Option<Arc<dyn Approver>>,
    approval_store: Option<Arc<dyn ApprovalStore>>,
    budget: Option<Arc<dyn BudgetManager>>,
    agent_id: String,
    include_error_messages: bool,
    max_error_length: usize,
    default_approval_ttl: Duration,
    outcome_error_count: AtomicU64,
}

impl Engine {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            policy: None,
            ledger: None,
            audit: None,
            approver: None,
            approval_store: None,
            budget: None,
            agent_id: None,
            include_error_messages: false,
            max_error_length: DEFAULT_MAX_ERROR_LENGTH,
            default_approval_ttl: DEFAULT_APPROVAL_TTL,
        }
    }

    /// Outcome-logging failures since engine creation.
    ///
    /// These are swallowed by design; the counter is the operational
    /// signal that the evidence trail is incomplete.
    #[must_use]
    pub fn outcome_error_count(&self) -> u64 {
        self.outcome_error_count.load(Ordering::Relaxed)
    }

    /// Executes a guarded call.
    ///
    /// `call` carries the original arguments for policy/ledger purposes;
    /// `func` is the guarded callable (typically a closure capturing those
    /// same originals). The callable runs only after the allow decision is
    /// durably recorded.
    ///
    /// # Cancellation
    ///
    /// Dropping the returned future after the decision write cancels the
    /// callable and skips the outcome record; the decision entry is
    /// already durable. Callers needing the outcome record must not cancel
    /// mid-execution (spawn the call instead).
    ///
    /// # Errors
    ///
    /// Returns the taxonomy of [`EngineError`]; every pre-execution
    /// failure denies.
    pub async fn execute<T, F, Fut, E>(
        &self,
        action: &str,
        call: CallArgs,
        options: CallOptions,
        func: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let effective_policy = options
            .policy_override
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.policy));
        let state = self.build_state(action, &call, &options, effective_policy.as_ref())?;

        // Policy evaluation: synchronous, deterministic, no I/O.
        let result = match effective_policy.evaluate(&state.ctx) {
            Ok(result) => result,
            Err(err) => {
                self.log_decision(
                    &state,
                    Decision::Deny,
                    "policy evaluation failed",
                    Some(policy::POLICY_EVALUATION_FAILED),
                    None,
                    None,
                    Some(self.safe_error("PolicyEvalError", &err.message)),
                )
                .await?;
                return Err(EngineError::Policy(err));
            }
        };
        let reason_code = result
            .reason_code
            .clone()
            .unwrap_or_else(|| result.decision.default_reason_code().to_string());

        match result.decision {
            Decision::Allow => {
                self.run_allowed(func, &state, &result.reason, &reason_code, None)
                    .await
            }
            Decision::Deny => {
                self.log_decision(
                    &state,
                    Decision::Deny,
                    &result.reason,
                    Some(&reason_code),
                    None,
                    None,
                    None,
                )
                .await?;
                Err(EngineError::ApprovalDenied {
                    reason: result.reason,
                })
            }
            Decision::RequireApproval => {
                self.run_with_approval(func, &state, &result, &reason_code)
                    .await
            }
        }
    }

    /// Captures the immutable call state: redaction happens here, exactly
    /// once, before anything else observes the arguments.
    fn build_state(
        &self,
        action: &str,
        call: &CallArgs,
        options: &CallOptions,
        effective_policy: &dyn Policy,
    ) -> Result<CallState, EngineError> {
        let request_id = Uuid::new_v4().to_string();
        let safe_args = redact_args(&call.args);
        let safe_kwargs = redact_map(&call.kwargs);
        let mut safe_metadata = redact_map(&call.metadata);
        safe_metadata.insert("agent_id".to_string(), Value::string(&self.agent_id));

        let ctx = Context::new(
            action,
            safe_args.clone(),
            safe_kwargs.clone(),
            safe_metadata,
        )?;

        let policy_hash = policy_hash(effective_policy).map_err(canonical_build_error)?;

        let mut parameters = Map::new();
        parameters.insert("args".to_string(), Value::Array(safe_args));
        parameters.insert("kwargs".to_string(), Value::Object(safe_kwargs));
        let parameters = Value::Object(parameters);

        let decision_time = Utc::now();
        let decision_at = format_timestamp(decision_time);
        let decision_hash = compute_decision_hash(
            &request_id,
            &decision_at,
            &policy_hash,
            &ctx.action,
            &parameters,
            &self.agent_id,
        )
        .map_err(|err| EngineError::Policy(PolicyEvalError::new(err.to_string())))?;

        let approval_ttl = options
            .approval_ttl
            .unwrap_or(self.default_approval_ttl)
            .min(Duration::from_secs(MAX_TTL_SECONDS));

        Ok(CallState {
            request_id,
            action: ctx.action.clone(),
            ctx,
            parameters,
            policy_id: effective_policy.policy_id().to_string(),
            policy_hash,
            decision_time,
            decision_at,
            decision_hash,
            agent_id: self.agent_id.clone(),
            budget_cost: options.budget_cost.unwrap_or(1),
            approval_ttl,
            commit_id: Uuid::new_v4().to_string(),
        })
    }

    /// Budget check, decision write, execution, and outcome write for an
    /// allowed call.
    async fn run_allowed<T, F, Fut, E>(
        &self,
        func: F,
        state: &CallState,
        reason: &str,
        reason_code: &str,
        approval: Option<Value>,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        // Budget check (fail-closed).
        let mut budget_block: Option<Value> = None;
        let mut budget_checked = false;
        if let Some(budget) = &self.budget {
            match budget
                .check(
                    &state.request_id,
                    &state.agent_id,
                    &state.action,
                    state.budget_cost,
                )
                .await
            {
                Ok(check) => {
                    budget_block = Some(budget_check_block(&check));
                    budget_checked = true;
                }
                Err(err) => {
                    let code = match &err {
                        BudgetError::Exceeded { scope } => scope.reason_code(),
                        _ => policy::BUDGET_EVALUATION_FAILED,
                    };
                    let reason = match &err {
                        BudgetError::Exceeded { .. } => "budget exceeded",
                        _ => "budget evaluation failed",
                    };
                    self.log_decision(
                        state,
                        Decision::Deny,
                        reason,
                        Some(code),
                        None,
                        Some(budget_denied_block(state, &err)),
                        None,
                    )
                    .await?;
                    return Err(EngineError::Budget(err));
                }
            }
        }

        // Decision write (fail-closed): execution is gated on this append.
        self.log_decision(
            state,
            Decision::Allow,
            reason,
            Some(reason_code),
            approval,
            budget_block,
            None,
        )
        .await?;

        // Execute the guarded callable with the original arguments.
        match func().await {
            Ok(value) => {
                self.log_outcome(state, reason, reason_code, "success", None, budget_checked)
                    .await;
                Ok(value)
            }
            Err(err) => {
                let envelope = self.safe_error(error_type_name::<E>(), &err.to_string());
                self.log_outcome(
                    state,
                    reason,
                    reason_code,
                    "error",
                    Some(envelope),
                    budget_checked,
                )
                .await;
                Err(EngineError::Execution(Box::new(err)))
            }
        }
    }

    /// Approval flow for `REQUIRE_APPROVAL` decisions.
    async fn run_with_approval<T, F, Fut, E>(
        &self,
        func: F,
        state: &CallState,
        result: &PolicyResult,
        reason_code: &str,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Some(approver) = &self.approver else {
            self.log_decision(
                state,
                Decision::Deny,
                "no approver configured",
                Some(policy::APPROVAL_PROCESS_FAILED),
                Some(self.approval_block(state, "failed", false, None, None, None)),
                None,
                None,
            )
            .await?;
            return Err(EngineError::Approval(ApproverError::new(
                "no approver configured",
            )));
        };

        let binding = state.binding();
        let expires_at = state.decision_time
            + chrono::Duration::from_std(state.approval_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(MAX_TTL_SECONDS as i64));

        // Persist pending state BEFORE yielding to the external approver.
        if let Some(store) = &self.approval_store {
            let staged = async {
                store.expire_stale().await?;
                store.create_pending(&binding, Some(expires_at)).await
            }
            .await;
            if let Err(err) = staged {
                self.log_decision(
                    state,
                    Decision::Deny,
                    "approval process failed",
                    Some(policy::APPROVAL_PROCESS_FAILED),
                    Some(self.approval_block(state, "failed", false, None, None, None)),
                    None,
                    Some(self.safe_error("ApprovalStoreError", &err.to_string())),
                )
                .await?;
                return Err(EngineError::Approval(ApproverError::new(err.to_string())));
            }
        }

        // Await approval under the per-call timeout; the event loop stays
        // free for other invocations.
        let response = tokio::time::timeout(
            state.approval_ttl,
            approver.approve(&state.ctx, result, &state.request_id),
        )
        .await;

        let response = match response {
            Err(_elapsed) => {
                let record = self
                    .resolve_and_fetch(state, ApprovalState::Expired, None)
                    .await;
                self.log_decision(
                    state,
                    Decision::Deny,
                    "approval expired",
                    Some(policy::APPROVAL_PROCESS_FAILED),
                    Some(self.approval_block(
                        state,
                        "expired",
                        false,
                        None,
                        Some(&binding),
                        record.as_ref(),
                    )),
                    None,
                    None,
                )
                .await?;
                return Err(EngineError::Approval(ApproverError::new(
                    "approval expired",
                )));
            }
            Ok(Err(err)) => {
                let record = self
                    .resolve_and_fetch(state, ApprovalState::Failed, None)
                    .await;
                self.log_decision(
                    state,
                    Decision::Deny,
                    "approval process failed",
                    Some(policy::APPROVAL_PROCESS_FAILED),
                    Some(self.approval_block(
                        state,
                        "failed",
                        false,
                        None,
                        Some(&binding),
                        record.as_ref(),
                    )),
                    None,
                    Some(self.safe_error("ApproverError", &err.message)),
                )
                .await?;
                return Err(EngineError::Approval(err));
            }
            Ok(Ok(response)) => response,
        };

        let parsed = parse_approval_response(response, &binding);

        if parsed.binding_mismatch {
            // A mismatched binding is a replay or cross-wiring, not a
            // human denial.
            let record = self
                .resolve_and_fetch(state, ApprovalState::Failed, parsed.approver_id.as_deref())
                .await;
            self.log_decision(
                state,
                Decision::Deny,
                "approval binding mismatch",
                Some(policy::APPROVAL_PROCESS_FAILED),
                Some(self.approval_block(
                    state,
                    "failed",
                    false,
                    parsed.approver_id.as_deref(),
                    Some(&parsed.binding),
                    record.as_ref(),
                )),
                None,
                None,
            )
            .await?;
            return Err(EngineError::ApprovalDenied {
                reason: "approval binding mismatch".to_string(),
            });
        }

        if !parsed.approved {
            let record = self
                .resolve_and_fetch(state, ApprovalState::Denied, parsed.approver_id.as_deref())
                .await;
            self.log_decision(
                state,
                Decision::Deny,
                &result.reason,
                Some(policy::APPROVAL_DENIED),
                Some(self.approval_block(
                    state,
                    "denied",
                    false,
                    parsed.approver_id.as_deref(),
                    Some(&parsed.binding),
                    record.as_ref(),
                )),
                None,
                None,
            )
            .await?;
            return Err(EngineError::ApprovalDenied {
                reason: result.reason.clone(),
            });
        }

        let record = self
            .resolve_and_fetch(state, ApprovalState::Approved, parsed.approver_id.as_deref())
            .await;
        let approval = self.approval_block(
            state,
            "approved",
            true,
            parsed.approver_id.as_deref(),
            Some(&parsed.binding),
            record.as_ref(),
        );
        self.run_allowed(func, state, &result.reason, reason_code, Some(approval))
            .await
    }

    /// Transitions the store record and reads it back for the ledger
    /// approval block. Store failures here must not mask the decision
    /// being logged, so they are reported and swallowed.
    async fn resolve_and_fetch(
        &self,
        state: &CallState,
        to: ApprovalState,
        approver_id: Option<&str>,
    ) -> Option<ApprovalRecord> {
        let store = self.approval_store.as_ref()?;
        if let Err(err) = store.resolve(&state.request_id, to, approver_id).await {
            tracing::warn!(
                request_id = %state.request_id,
                error = %err,
                "approval store resolve failed"
            );
        }
        match store.fetch(&state.request_id).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(
                    request_id = %state.request_id,
                    error = %err,
                    "approval store fetch failed"
                );
                None
            }
        }
    }

    /// Builds and appends a decision entry; fail-closed.
    #[allow(clippy::too_many_arguments)]
    async fn log_decision(
        &self,
        state: &CallState,
        effect: Decision,
        reason: &str,
        reason_code: Option<&str>,
        approval: Option<Value>,
        budget: Option<Value>,
        error: Option<Value>,
    ) -> Result<(), EngineError> {
        let mut decision = Map::new();
        decision.insert("effect".to_string(), Value::string(effect.as_str()));
        decision.insert("reason".to_string(), Value::string(reason));
        decision.insert(
            "reason_code".to_string(),
            reason_code.map_or(Value::Null, Value::string),
        );
        decision.insert("policy_id".to_string(), Value::string(&state.policy_id));
        decision.insert("policy_hash".to_string(), Value::string(&state.policy_hash));
        decision.insert(
            "decision_hash".to_string(),
            Value::string(&state.decision_hash),
        );

        let mut metadata = Map::new();
        if let Some(code) = reason_code {
            metadata.insert("reason_code".to_string(), Value::string(code));
        }
        if let Some(error) = error {
            metadata.insert("error".to_string(), error);
        }

        let mut entry = Map::new();
        entry.insert("schema_version".to_string(), Value::string(SCHEMA_VERSION));
        entry.insert("ledger_version".to_string(), Value::string(LEDGER_VERSION));
        entry.insert("request_id".to_string(), Value::string(&state.request_id));
        entry.insert("created_at".to_string(), Value::string(&state.decision_at));
        entry.insert("event".to_string(), Value::string("decision"));
        entry.insert("action".to_string(), Value::string(&state.action));
        entry.insert("agent_id".to_string(), Value::string(&state.agent_id));
        entry.insert("decision".to_string(), Value::Object(decision));
        entry.insert("approval".to_string(), approval.unwrap_or(Value::Null));
        entry.insert("budget".to_string(), budget.unwrap_or(Value::Null));
        entry.insert("parameters".to_string(), state.parameters.clone());
        entry.insert("metadata".to_string(), Value::Object(metadata));

        self.ledger.append(entry).await.map_err(|err| {
            tracing::warn!(
                request_id = %state.request_id,
                reason_code = policy::LEDGER_WRITE_FAILED_DECISION,
                error = %err,
                "failed to write decision to ledger"
            );
            EngineError::AuditLog {
                reason_code: policy::LEDGER_WRITE_FAILED_DECISION,
                message: format!("failed to write decision to ledger: {err}"),
            }
        })?;

        if let Some(audit) = &self.audit {
            let audit_entry = AuditEntry {
                timestamp: state.decision_time,
                request_id: state.request_id.clone(),
                event: "decision".to_string(),
                action: state.action.clone(),
                decision: effect,
                reason: reason.to_string(),
                outcome: None,
                error_type: None,
                error: None,
                metadata: serde_json::json!({
                    "reason_code": reason_code,
                    "agent_id": state.agent_id,
                }),
            };
            audit.log(&audit_entry).await.map_err(|err| {
                tracing::warn!(
                    request_id = %state.request_id,
                    reason_code = policy::LEDGER_WRITE_FAILED_DECISION,
                    error = %err,
                    "failed to write decision to audit log"
                );
                EngineError::AuditLog {
                    reason_code: policy::LEDGER_WRITE_FAILED_DECISION,
                    message: format!("failed to write decision to audit log: {err}"),
                }
            })?;
        }
        Ok(())
    }

    /// Builds and appends an outcome entry; best-effort by design.
    async fn log_outcome(
        &self,
        state: &CallState,
        reason: &str,
        reason_code: &str,
        status: &str,
        error: Option<Value>,
        budget_checked: bool,
    ) {
        // Finalize the budget reservation first so a crash after execution
        // still converges on the committed charge.
        if budget_checked {
            if let Some(budget) = &self.budget {
                if let Err(err) = budget
                    .commit(&state.request_id, &state.commit_id, state.budget_cost)
                    .await
                {
                    self.outcome_error_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        request_id = %state.request_id,
                        error = %err,
                        "budget commit failed"
                    );
                }
            }
        }

        let (error_type, error_message) = match &error {
            Some(envelope) => (
                envelope
                    .as_object()
                    .and_then(|map| map.get("error_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                envelope
                    .as_object()
                    .and_then(|map| map.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            None => (None, None),
        };

        let mut decision = Map::new();
        decision.insert(
            "decision_hash".to_string(),
            Value::string(&state.decision_hash),
        );
        decision.insert("policy_id".to_string(), Value::string(&state.policy_id));
        decision.insert("policy_hash".to_string(), Value::string(&state.policy_hash));
        decision.insert("reason".to_string(), Value::string(reason));
        decision.insert("reason_code".to_string(), Value::string(reason_code));

        let mut outcome = Map::new();
        outcome.insert("status".to_string(), Value::string(status));
        outcome.insert(
            "error_type".to_string(),
            error_type.as_deref().map_or(Value::Null, Value::string),
        );
        outcome.insert(
            "error".to_string(),
            error_message.as_deref().map_or(Value::Null, Value::string),
        );

        let outcome_time = Utc::now();
        let mut entry = Map::new();
        entry.insert("schema_version".to_string(), Value::string(SCHEMA_VERSION));
        entry.insert("ledger_version".to_string(), Value::string(LEDGER_VERSION));
        entry.insert("request_id".to_string(), Value::string(&state.request_id));
        entry.insert(
            "created_at".to_string(),
            Value::string(format_timestamp(outcome_time)),
        );
        entry.insert("event".to_string(), Value::string("outcome"));
        entry.insert("action".to_string(), Value::string(&state.action));
        entry.insert("agent_id".to_string(), Value::string(&state.agent_id));
        entry.insert("decision".to_string(), Value::Object(decision));
        entry.insert("outcome".to_string(), Value::Object(outcome));
        entry.insert("parameters".to_string(), state.parameters.clone());

        if let Err(err) = self.ledger.append(entry).await {
            self.outcome_error_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                request_id = %state.request_id,
                error = %err,
                "failed to write outcome to ledger"
            );
        }

        if let Some(audit) = &self.audit {
            let audit_entry = AuditEntry {
                timestamp: outcome_time,
                request_id: state.request_id.clone(),
                event: "outcome".to_string(),
                action: state.action.clone(),
                decision: Decision::Allow,
                reason: reason.to_string(),
                outcome: Some(status.to_string()),
                error_type,
                error: error_message,
                metadata: serde_json::json!({}),
            };
            if let Err(err) = audit.log(&audit_entry).await {
                self.outcome_error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    request_id = %state.request_id,
                    error = %err,
                    "failed to write outcome to audit log"
                );
            }
        }
    }

    /// Builds the ledger approval block.
    fn approval_block(
        &self,
        state: &CallState,
        fallback_state: &str,
        approved: bool,
        approver_id: Option<&str>,
        binding: Option<&ApprovalBinding>,
        record: Option<&ApprovalRecord>,
    ) -> Value {
        let mut block = Map::new();
        block.insert(
            "approval_id".to_string(),
            Value::string(
                record.map_or_else(|| state.request_id.clone(), |r| r.approval_id.clone()),
            ),
        );
        block.insert(
            "state".to_string(),
            Value::string(record.map_or(fallback_state, |r| r.state.as_str())),
        );
        block.insert(
            "approver_id".to_string(),
            record
                .and_then(|r| r.approver_id.as_deref())
                .or(approver_id)
                .map_or(Value::Null, Value::string),
        );
        block.insert("approved".to_string(), Value::Bool(approved));
        block.insert(
            "created_at".to_string(),
            record.map_or(Value::Null, |r| {
                Value::string(format_timestamp(r.created_at))
            }),
        );
        block.insert(
            "resolved_at".to_string(),
            record
                .and_then(|r| r.resolved_at)
                .map_or(Value::Null, |at| Value::string(format_timestamp(at))),
        );
        block.insert(
            "expires_at".to_string(),
            record
                .and_then(|r| r.expires_at)
                .map_or(Value::Null, |at| Value::string(format_timestamp(at))),
        );
        block.insert(
            "binding".to_string(),
            binding.map_or(Value::Null, binding_block),
        );
        Value::Object(block)
    }

    /// Builds a sanitized error envelope for ledger metadata.
    fn safe_error(&self, error_type: &str, message: &str) -> Value {
        let mut text = if self.include_error_messages {
            message.to_string()
        } else {
            error_type.to_string()
        };
        // Never leak filesystem paths into evidence.
        if text.contains('/') || text.contains('\\') {
            text = error_type.to_string();
        }
        if text.len() > self.max_error_length {
            let cut = self.max_error_length.saturating_sub(3);
            let cut = (0..=cut).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
            text.truncate(cut);
            text.push_str("...");
        }
        let mut envelope = Map::new();
        envelope.insert("error".to_string(), Value::string(&text));
        envelope.insert("error_type".to_string(), Value::string(error_type));
        Value::Object(envelope)
    }
}

struct ParsedApproval {
    approved: bool,
    binding: ApprovalBinding,
    approver_id: Option<String>,
    binding_mismatch: bool,
}

/// Normalizes an approver response against the expected binding.
///
/// A response with no binding inherits the expected one; a response whose
/// binding differs in any field is rejected outright (replay protection).
fn parse_approval_response(response: ApprovalResponse, expected: &ApprovalBinding) -> ParsedApproval {
    match response {
        ApprovalResponse::Verdict(approved) => ParsedApproval {
            approved,
            binding: expected.clone(),
            approver_id: None,
            binding_mismatch: false,
        },
        ApprovalResponse::Detailed {
            approved,
            approver_id,
            binding,
        } => {
            let binding = binding.unwrap_or_else(|| expected.clone());
            let binding_mismatch = binding != *expected;
            ParsedApproval {
                approved: approved && !binding_mismatch,
                binding,
                approver_id: approver_id.filter(|id| !id.trim().is_empty()),
                binding_mismatch,
            }
        }
    }
}

fn binding_block(binding: &ApprovalBinding) -> Value {
    let mut block = Map::new();
    block.insert(
        "request_id".to_string(),
        Value::string(&binding.request_id),
    );
    block.insert(
        "policy_hash".to_string(),
        Value::string(&binding.policy_hash),
    );
    block.insert(
        "decision_hash".to_string(),
        Value::string(&binding.decision_hash),
    );
    Value::Object(block)
}

fn budget_check_block(check: &BudgetCheck) -> Value {
    let mut block = Map::new();
    block.insert("check_id".to_string(), Value::string(&check.check_id));
    block.insert("request_id".to_string(), Value::string(&check.request_id));
    block.insert(
        "limit".to_string(),
        check.limit.map_or(Value::Null, Value::from),
    );
    block.insert(
        "projected_cost".to_string(),
        Value::from(check.projected_cost),
    );
    block.insert("currency".to_string(), Value::string(&check.currency));
    block.insert("succeeded".to_string(), Value::Bool(check.succeeded));
    block.insert(
        "checked_at".to_string(),
        Value::string(format_timestamp(check.checked_at)),
    );
    Value::Object(block)
}

fn budget_denied_block(state: &CallState, err: &BudgetError) -> Value {
    let mut block = Map::new();
    block.insert("request_id".to_string(), Value::string(&state.request_id));
    block.insert("cost".to_string(), Value::from(state.budget_cost));
    block.insert("succeeded".to_string(), Value::Bool(false));
    block.insert(
        "scope".to_string(),
        match err {
            BudgetError::Exceeded {
                scope: BudgetScope::Agent,
            } => Value::string("agent"),
            BudgetError::Exceeded {
                scope: BudgetScope::Tool,
            } => Value::string("tool"),
            _ => Value::Null,
        },
    );
    Value::Object(block)
}

fn canonical_build_error(err: CanonicalError) -> EngineError {
    EngineError::Policy(PolicyEvalError::new(err.to_string()))
}

/// Short type name recorded as `error_type` for callable failures.
fn error_type_name<E>() -> &'static str {
    std::any::type_name::<E>()
        .rsplit("::")
        .next()
        .unwrap_or("Error")
}
