//! Policy contract and built-in policies.
//!
//! A policy is a pure decision function over a redacted call context. The
//! engine depends only on the [`Policy`] trait; concrete policies are
//! injected at construction (no registries, no global lookup). Policies are
//! shared across concurrent invocations and must be side-effect-free.

use thiserror::Error;

use crate::canonical::{self, CanonicalError, Map, Value};

// Stable reason codes recorded in decision metadata. Emitted verbatim so
// post-hoc analysis can match on them.

/// Policy allowed the call as low risk.
pub const POLICY_ALLOW_LOW_RISK: &str = "POLICY_ALLOW_LOW_RISK";
/// Policy denied the call as high risk.
pub const POLICY_DENY_HIGH_RISK: &str = "POLICY_DENY_HIGH_RISK";
/// Policy routed the call to a human approver.
pub const POLICY_REQUIRE_APPROVAL_HIGH_VALUE: &str = "POLICY_REQUIRE_APPROVAL_HIGH_VALUE";
/// Policy raised or returned an invalid result; denied fail-closed.
pub const POLICY_EVALUATION_FAILED: &str = "POLICY_EVALUATION_FAILED";
/// Per-agent budget window exhausted.
pub const BUDGET_EXCEEDED_AGENT_RATE: &str = "BUDGET_EXCEEDED_AGENT_RATE";
/// Per-tool budget window exhausted.
pub const BUDGET_EXCEEDED_TOOL_RATE: &str = "BUDGET_EXCEEDED_TOOL_RATE";
/// Budget manager failed; denied fail-closed.
pub const BUDGET_EVALUATION_FAILED: &str = "BUDGET_EVALUATION_FAILED";
/// Approver rejected the call.
pub const APPROVAL_DENIED: &str = "APPROVAL_DENIED";
/// Approval flow failed (timeout, transport, binding mismatch).
pub const APPROVAL_PROCESS_FAILED: &str = "APPROVAL_PROCESS_FAILED";
/// Decision could not be written to the ledger; execution blocked.
pub const LEDGER_WRITE_FAILED_DECISION: &str = "LEDGER_WRITE_FAILED_DECISION";

/// Immutable snapshot of one pending invocation.
///
/// Built by the engine after redaction; every field a policy (or approver)
/// sees has already been scrubbed.
#[derive(Debug, Clone)]
pub struct Context {
    /// Fully-qualified callable identity.
    pub action: String,
    /// Redacted positional arguments.
    pub args: Vec<Value>,
    /// Redacted keyword arguments.
    pub kwargs: Map,
    /// Redacted metadata (`agent_id`, correlation ids, caller extras).
    pub metadata: Map,
}

impl Context {
    /// Builds a context. `action` must be non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyEvalError`] when `action` is empty or blank.
    pub fn new(
        action: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map,
        metadata: Map,
    ) -> Result<Self, PolicyEvalError> {
        let action = action.into();
        if action.trim().is_empty() {
            return Err(PolicyEvalError::new("action must be a non-empty string"));
        }
        Ok(Self {
            action,
            args,
            kwargs,
            metadata,
        })
    }

    /// Returns the agent id from metadata, if present.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.metadata.get("agent_id").and_then(Value::as_str)
    }
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Execute without further checks.
    Allow,
    /// Refuse; the callable is never invoked.
    Deny,
    /// Execute only after an external approval.
    RequireApproval,
}

impl Decision {
    /// Wire form used in ledger entries.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireApproval => "require_approval",
        }
    }

    /// Reason code recorded when the policy supplies none.
    #[must_use]
    pub const fn default_reason_code(self) -> &'static str {
        match self {
            Self::Allow => POLICY_ALLOW_LOW_RISK,
            Self::Deny => POLICY_DENY_HIGH_RISK,
            Self::RequireApproval => POLICY_REQUIRE_APPROVAL_HIGH_VALUE,
        }
    }
}

/// Result returned by [`Policy::evaluate`].
#[derive(Debug, Clone)]
pub struct PolicyResult {
    /// The decision variant.
    pub decision: Decision,
    /// Human-readable justification; must be non-empty.
    pub reason: String,
    /// Optional stable taxonomy tag; defaulted per decision when absent.
    pub reason_code: Option<String>,
}

impl PolicyResult {
    fn new(decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: reason.into(),
            reason_code: None,
        }
    }

    /// Allow with a reason.
    #[must_use]
    pub fn allow(reason: impl Into<String>) -> Self {
        Self::new(Decision::Allow, reason)
    }

    /// Deny with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::new(Decision::Deny, reason)
    }

    /// Require external approval with a reason.
    #[must_use]
    pub fn require_approval(reason: impl Into<String>) -> Self {
        Self::new(Decision::RequireApproval, reason)
    }

    /// Attaches an explicit reason code.
    #[must_use]
    pub fn with_reason_code(mut self, code: impl Into<String>) -> Self {
        self.reason_code = Some(code.into());
        self
    }
}

/// Error from a failing policy evaluation.
///
/// The engine converts this to a fail-closed deny with reason code
/// [`POLICY_EVALUATION_FAILED`].
#[derive(Debug, Error, Clone)]
#[error("policy evaluation failed: {message}")]
pub struct PolicyEvalError {
    /// Description of the failure.
    pub message: String,
}

impl PolicyEvalError {
    /// Builds an error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A deterministic decision function over a redacted call context.
///
/// `evaluate` must be pure: no I/O, no mutation, safe to call concurrently
/// from multiple invocation state machines.
pub trait Policy: Send + Sync {
    /// Evaluates the context.
    ///
    /// # Errors
    ///
    /// Implementations return [`PolicyEvalError`] instead of panicking; the
    /// engine treats any error as a deny.
    fn evaluate(&self, ctx: &Context) -> Result<PolicyResult, PolicyEvalError>;

    /// Stable identifier mixed into `policy_hash`.
    fn policy_id(&self) -> &str;

    /// Optional digest of the policy's source or configuration.
    ///
    /// When present it is mixed into `policy_hash`, so a reconfigured
    /// policy yields distinct decision hashes.
    fn source_digest(&self) -> Option<String> {
        None
    }
}

/// Derives the stable `policy_hash` for a policy.
///
/// The hash covers the canonical object
/// `{"policy_id": <id>, "source_digest": <digest or null>}`.
///
/// # Errors
///
/// Propagates canonical-encoding failures.
pub fn policy_hash(policy: &dyn Policy) -> Result<String, CanonicalError> {
    let mut payload = Map::new();
    payload.insert("policy_id".to_string(), Value::string(policy.policy_id()));
    payload.insert(
        "source_digest".to_string(),
        Value::from(policy.source_digest()),
    );
    canonical::canonical_sha256_hex(&Value::Object(payload))
}

/// Policy that allows every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn evaluate(&self, _ctx: &Context) -> Result<PolicyResult, PolicyEvalError> {
        Ok(PolicyResult::allow("allowed"))
    }

    fn policy_id(&self) -> &str {
        "allow_all"
    }
}

/// Policy that denies every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Policy for DenyAll {
    fn evaluate(&self, _ctx: &Context) -> Result<PolicyResult, PolicyEvalError> {
        Ok(PolicyResult::deny("denied"))
    }

    fn policy_id(&self) -> &str {
        "deny_all"
    }
}
