//! Fail-closed authorization boundary for agent tool calls.
//!
//! `toolgate-core` wraps sensitive function invocations in a guarded-call
//! pipeline: a deterministic policy decision, an optional human approval
//! bound to that exact decision, an optional budget check, a durable write
//! to a tamper-evident hash-chained ledger, execution, and a best-effort
//! outcome record. If any step before execution fails, the guarded
//! function is not invoked and the caller observes a typed error.
//!
//! # Architecture
//!
//! ```text
//! Engine (state machine, fail-closed)
//!   |- redact      deterministic scrubbing, applied once
//!   |- policy      pure decision function (injected)
//!   |- approval    store + approver, binding-checked, single-use
//!   |- budget      idempotent check/commit counters
//!   |- ledger      append-only hash chain (JSONL or SQLite)
//!   |- audit       operational (non-chained) JSONL sink
//!   `- crypto      optional Ed25519 entry signatures
//! ```
//!
//! All hashing flows through [`canonical`]: a restricted, deterministic
//! JSON profile whose golden vectors pin the ledger wire format.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use toolgate_core::engine::{CallArgs, CallOptions, Engine};
//! use toolgate_core::ledger::JsonlLedger;
//! use toolgate_core::policy::AllowAll;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::builder()
//!     .policy(Arc::new(AllowAll))
//!     .ledger(Arc::new(JsonlLedger::new("evidence.jsonl")))
//!     .agent_id("billing-agent")
//!     .build()?;
//!
//! let amount = 10i64;
//! let refunded = engine
//!     .execute(
//!         "billing.refund",
//!         CallArgs::new().kwarg("user", "u1").kwarg("amount", amount),
//!         CallOptions::default(),
//!         || async move { Ok::<_, std::io::Error>(amount) },
//!     )
//!     .await?;
//! assert_eq!(refunded, 10);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod approval;
pub mod audit;
pub mod budget;
pub mod canonical;
pub mod crypto;
pub mod engine;
pub mod ledger;
pub mod policy;
pub mod redact;

/// A boxed future for object-safe async trait methods.
///
/// All injected collaborators (ledger, budget manager, approval store,
/// approver, audit sink) use this alias so the engine can hold them as
/// trait objects.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
