//! Demo: guard a refund call, then verify the evidence it left behind.
//!
//! Environment switches (demo-only):
//! - `TOOLGATE_LEDGER_PATH`: where to write the evidence ledger
//!   (default `evidence.jsonl`).
//! - `TOOLGATE_AUTO_APPROVE=1`: auto-approve the high-value refund instead
//!   of denying it.
//!
//! Run with: `cargo run -p toolgate-cli --example guarded_refund`

use std::path::PathBuf;
use std::sync::Arc;

use toolgate_core::engine::{BlockingEngine, CallArgs, CallOptions, Engine};
use toolgate_core::approval::StaticApprover;
use toolgate_core::ledger::JsonlLedger;
use toolgate_core::policy::{Context, Policy, PolicyEvalError, PolicyResult};

/// Refunds at or under the limit pass; larger ones need a human.
struct RefundPolicy {
    limit: i64,
}

impl Policy for RefundPolicy {
    fn evaluate(&self, ctx: &Context) -> Result<PolicyResult, PolicyEvalError> {
        let amount = ctx
            .kwargs
            .get("amount")
            .and_then(|value| match value {
                toolgate_core::canonical::Value::Number(number) => {
                    number.as_str().parse::<i64>().ok()
                }
                _ => None,
            })
            .unwrap_or(0);
        if amount <= self.limit {
            Ok(PolicyResult::allow("within limit"))
        } else {
            Ok(PolicyResult::require_approval("refund over limit"))
        }
    }

    fn policy_id(&self) -> &str {
        "refund_limit"
    }
}

fn refund(user: &str, amount: i64) -> Result<i64, std::io::Error> {
    println!("refunding {amount} to {user}");
    Ok(amount)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ledger_path = std::env::var_os("TOOLGATE_LEDGER_PATH")
        .map_or_else(|| PathBuf::from("evidence.jsonl"), PathBuf::from);
    let auto_approve = std::env::var_os("TOOLGATE_AUTO_APPROVE").is_some_and(|v| v == "1");

    let ledger = JsonlLedger::new(&ledger_path);
    let engine = Engine::builder()
        .policy(Arc::new(RefundPolicy { limit: 100 }))
        .ledger(Arc::new(ledger.clone()))
        .approver(Arc::new(
            StaticApprover::new(auto_approve).with_approver_id("demo"),
        ))
        .agent_id("demo-agent")
        .build()?;
    let engine = BlockingEngine::new(engine)?;

    // Small refund: allowed by policy.
    let refunded = engine.execute(
        "billing.refund",
        CallArgs::new().kwarg("user", "u1").kwarg("amount", 10i64),
        CallOptions::default(),
        || refund("u1", 10),
    )?;
    println!("refunded: {refunded}");

    // Large refund: requires approval; verdict comes from the switch.
    let outcome = engine.execute(
        "billing.refund",
        CallArgs::new().kwarg("user", "u2").kwarg("amount", 1500i64),
        CallOptions::default(),
        || refund("u2", 1500),
    );
    match outcome {
        Ok(refunded) => println!("refunded: {refunded}"),
        Err(err) => println!("blocked: {err}"),
    }

    let report = ledger.verify_blocking(None)?;
    println!(
        "ledger {} verified: ok={} entries={}",
        ledger_path.display(),
        report.ok,
        report.entries
    );
    Ok(())
}
