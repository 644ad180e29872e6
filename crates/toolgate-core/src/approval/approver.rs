//! Built-in approvers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::BoxFuture;
use crate::policy::{Context, PolicyResult};

use super::{ApprovalResponse, ApprovalState, ApprovalStore, ApproverError};

/// External approval contract.
///
/// The engine submits a pending approval keyed by `request_id`, then awaits
/// this call under its own timeout. Implementations resolve out of band
/// (chat message, dashboard, queue) and return a verdict; neither side
/// holds a reference into the other's internals.
pub trait Approver: Send + Sync {
    /// Requests approval for one invocation.
    fn approve<'a>(
        &'a self,
        ctx: &'a Context,
        result: &'a PolicyResult,
        request_id: &'a str,
    ) -> BoxFuture<'a, Result<ApprovalResponse, ApproverError>>;
}

/// Approver with a fixed verdict.
///
/// Used by tests and by demo auto-approve switches; not an authorization
/// mechanism.
#[derive(Debug, Clone)]
pub struct StaticApprover {
    verdict: bool,
    approver_id: Option<String>,
}

impl StaticApprover {
    /// Creates an approver that always answers `verdict`.
    #[must_use]
    pub fn new(verdict: bool) -> Self {
        Self {
            verdict,
            approver_id: None,
        }
    }

    /// Attaches an approver identity to responses.
    #[must_use]
    pub fn with_approver_id(mut self, approver_id: impl Into<String>) -> Self {
        self.approver_id = Some(approver_id.into());
        self
    }
}

impl Approver for StaticApprover {
    fn approve<'a>(
        &'a self,
        _ctx: &'a Context,
        _result: &'a PolicyResult,
        _request_id: &'a str,
    ) -> BoxFuture<'a, Result<ApprovalResponse, ApproverError>> {
        Box::pin(async move {
            Ok(ApprovalResponse::Detailed {
                approved: self.verdict,
                approver_id: self.approver_id.clone(),
                binding: None,
            })
        })
    }
}

/// Approver that polls a durable store until resolution.
///
/// The engine persists the pending record before calling `approve`; this
/// approver sleeps between polls (yielding the event loop) and returns when
/// the store shows a terminal state. An external process flips the record.
pub struct PollingApprover {
    store: Arc<dyn ApprovalStore>,
    poll_interval: Duration,
    timeout: Duration,
}

impl PollingApprover {
    /// Default interval between store polls.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

    /// Default overall wait before giving up.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Creates a polling approver over `store` with default pacing.
    #[must_use]
    pub fn new(store: Arc<dyn ApprovalStore>) -> Self {
        Self {
            store,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Overrides the overall timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Approver for PollingApprover {
    fn approve<'a>(
        &'a self,
        _ctx: &'a Context,
        _result: &'a PolicyResult,
        request_id: &'a str,
    ) -> BoxFuture<'a, Result<ApprovalResponse, ApproverError>> {
        Box::pin(async move {
            let deadline = Utc::now()
                + chrono::Duration::from_std(self.timeout)
                    .unwrap_or_else(|_| chrono::Duration::days(365_000));
            while Utc::now() < deadline {
                let record = self
                    .store
                    .fetch(request_id)
                    .await
                    .map_err(|err| ApproverError::new(err.to_string()))?;
                let Some(record) = record else {
                    // No pending record means nothing to approve.
                    return Ok(ApprovalResponse::Verdict(false));
                };
                match record.state {
                    ApprovalState::Approved => {
                        return Ok(ApprovalResponse::Detailed {
                            approved: true,
                            approver_id: record.approver_id.clone(),
                            binding: Some(record.binding),
                        });
                    }
                    ApprovalState::Denied | ApprovalState::Expired | ApprovalState::Failed => {
                        return Ok(ApprovalResponse::Verdict(false));
                    }
                    ApprovalState::Pending => {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
            Err(ApproverError::new(format!(
                "approval wait exceeded {}s for request {request_id}",
                self.timeout.as_secs()
            )))
        })
    }
}
