//! Tests for approval stores and built-in approvers.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use crate::canonical::Map;
use crate::policy::{Context, PolicyResult};

use super::*;

fn binding(request_id: &str) -> ApprovalBinding {
    ApprovalBinding {
        request_id: request_id.to_string(),
        policy_hash: "p".repeat(64),
        decision_hash: "d".repeat(64),
    }
}

async fn exercise_store(store: &dyn ApprovalStore) {
    let b = binding("req-1");
    store.create_pending(&b, None).await.expect("create");

    let record = store.fetch("req-1").await.expect("fetch").expect("record");
    assert_eq!(record.state, ApprovalState::Pending);
    assert_eq!(record.binding, b);
    assert!(record.expires_at.is_some());
    assert!(!record.approved());

    // Re-creating a still-pending record with the same binding refreshes it.
    store.create_pending(&b, None).await.expect("refresh");

    // A conflicting binding is rejected.
    let mut conflicting = b.clone();
    conflicting.decision_hash = "e".repeat(64);
    let err = store.create_pending(&conflicting, None).await.unwrap_err();
    assert!(matches!(err, ApprovalStoreError::BindingMismatch { .. }));

    // Resolution is atomic and single-use.
    store
        .resolve("req-1", ApprovalState::Approved, Some("ops-1"))
        .await
        .expect("resolve");
    let record = store.fetch("req-1").await.expect("fetch").expect("record");
    assert_eq!(record.state, ApprovalState::Approved);
    assert_eq!(record.approver_id.as_deref(), Some("ops-1"));
    assert!(record.resolved_at.is_some());
    assert!(record.approved());

    // Same terminal state is a no-op; a different one is rejected.
    store
        .resolve("req-1", ApprovalState::Approved, Some("ops-1"))
        .await
        .expect("idempotent resolve");
    let err = store
        .resolve("req-1", ApprovalState::Denied, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalStoreError::InvalidTransition { .. }));

    // Resolved records are left alone by create_pending.
    store.create_pending(&b, None).await.expect("no-op");
    let record = store.fetch("req-1").await.expect("fetch").expect("record");
    assert_eq!(record.state, ApprovalState::Approved);

    // Unknown requests are reported as such.
    let err = store
        .resolve("missing", ApprovalState::Denied, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalStoreError::NotFound { .. }));
    assert!(store.fetch("missing").await.expect("fetch").is_none());
}

#[tokio::test]
async fn memory_store_contract() {
    let store = MemoryApprovalStore::new();
    exercise_store(&store).await;
}

#[tokio::test]
async fn sqlite_store_contract() {
    let dir = TempDir::new().expect("temp dir");
    let store = SqliteApprovalStore::open(dir.path().join("approvals.db")).expect("open");
    exercise_store(&store).await;
}

#[tokio::test]
async fn expired_pendings_transition_to_expired() {
    let store = MemoryApprovalStore::new();
    let b = binding("req-1");
    store
        .create_pending(&b, Some(Utc::now() - Duration::seconds(1)))
        .await
        .expect("create");

    let record = store.fetch("req-1").await.expect("fetch").expect("record");
    assert_eq!(record.state, ApprovalState::Expired);

    // Expired is terminal: approval after the fact is rejected.
    let err = store
        .resolve("req-1", ApprovalState::Approved, Some("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalStoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn expire_stale_sweeps_pendings() {
    let dir = TempDir::new().expect("temp dir");
    let store = SqliteApprovalStore::open(dir.path().join("approvals.db")).expect("open");
    store
        .create_pending(&binding("req-1"), Some(Utc::now() - Duration::seconds(1)))
        .await
        .expect("create");
    // create_pending sweeps before inserting, so req-1 is already expired
    // by the time req-2 lands.
    store
        .create_pending(&binding("req-2"), None)
        .await
        .expect("create");
    assert_eq!(store.expire_stale().await.expect("sweep"), 0);
    let record = store.fetch("req-1").await.expect("fetch").expect("record");
    assert_eq!(record.state, ApprovalState::Expired);
}

#[tokio::test]
async fn ttl_is_capped_at_the_hard_maximum() {
    let store = MemoryApprovalStore::new();
    let far = Utc::now() + Duration::seconds(86_400);
    store
        .create_pending(&binding("req-1"), Some(far))
        .await
        .expect("create");
    let record = store.fetch("req-1").await.expect("fetch").expect("record");
    let expires_at = record.expires_at.expect("expires");
    let cap = Utc::now() + Duration::seconds(MAX_TTL_SECONDS as i64 + 5);
    assert!(expires_at < cap);
}

fn test_context() -> Context {
    Context::new("demo.action", Vec::new(), Map::new(), Map::new()).expect("context")
}

#[tokio::test]
async fn static_approver_reports_verdict_and_identity() {
    let approver = StaticApprover::new(true).with_approver_id("ops-1");
    let response = approver
        .approve(
            &test_context(),
            &PolicyResult::require_approval("high value"),
            "req-1",
        )
        .await
        .expect("approve");
    match response {
        ApprovalResponse::Detailed {
            approved,
            approver_id,
            binding,
        } => {
            assert!(approved);
            assert_eq!(approver_id.as_deref(), Some("ops-1"));
            assert!(binding.is_none());
        }
        ApprovalResponse::Verdict(_) => panic!("expected detailed response"),
    }
}

#[tokio::test]
async fn polling_approver_returns_resolution_with_binding() {
    let store = Arc::new(MemoryApprovalStore::new());
    let b = binding("req-1");
    store.create_pending(&b, None).await.expect("create");

    let approver = PollingApprover::new(store.clone())
        .with_poll_interval(StdDuration::from_millis(5))
        .with_timeout(StdDuration::from_secs(5));

    let resolver = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            store
                .resolve("req-1", ApprovalState::Approved, Some("ops-2"))
                .await
                .expect("resolve");
        })
    };

    let response = approver
        .approve(
            &test_context(),
            &PolicyResult::require_approval("high value"),
            "req-1",
        )
        .await
        .expect("approve");
    resolver.await.expect("resolver task");

    match response {
        ApprovalResponse::Detailed {
            approved,
            approver_id,
            binding,
        } => {
            assert!(approved);
            assert_eq!(approver_id.as_deref(), Some("ops-2"));
            assert_eq!(binding.expect("binding"), b);
        }
        ApprovalResponse::Verdict(_) => panic!("expected detailed response"),
    }
}

#[tokio::test]
async fn polling_approver_treats_denial_and_absence_as_denied() {
    let store = Arc::new(MemoryApprovalStore::new());
    let approver = PollingApprover::new(store.clone())
        .with_poll_interval(StdDuration::from_millis(5))
        .with_timeout(StdDuration::from_secs(1));

    // Absent record.
    let response = approver
        .approve(
            &test_context(),
            &PolicyResult::require_approval("high value"),
            "req-absent",
        )
        .await
        .expect("approve");
    assert!(matches!(response, ApprovalResponse::Verdict(false)));

    // Denied record.
    let b = binding("req-1");
    store.create_pending(&b, None).await.expect("create");
    store
        .resolve("req-1", ApprovalState::Denied, Some("ops-1"))
        .await
        .expect("resolve");
    let response = approver
        .approve(
            &test_context(),
            &PolicyResult::require_approval("high value"),
            "req-1",
        )
        .await
        .expect("approve");
    assert!(matches!(response, ApprovalResponse::Verdict(false)));
}
