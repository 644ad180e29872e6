//! Offline chain verification shared by both backends.
//!
//! Verification replays the ledger in order, re-deriving every hash from
//! stored bytes. Failure kinds are a closed vocabulary; each report carries
//! the zero-based position of the first offending entry.

use serde::Serialize;

use crate::canonical::{self, Map, Value};
use crate::crypto::{VerifyingKey, verify_entry_hash};

use super::entry::compute_decision_hash;
use super::{LEDGER_VERSION, SCHEMA_VERSION};

/// Enumerated verification failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// `prev_entry_hash` does not match the preceding entry.
    ChainBreak,
    /// A recomputed hash disagrees with the stored one.
    Tamper,
    /// Unsupported `schema_version` or `ledger_version`.
    Version,
    /// Outcome entry references an unknown decision hash.
    OrphanOutcome,
    /// Outcome entry's request id disagrees with its decision, or a
    /// decision hash appears twice.
    BoundMismatch,
    /// Entry signature missing or invalid under the supplied key.
    Signature,
    /// Stored bytes are not in canonical form (including truncation).
    CanonicalForm,
}

impl FailureKind {
    /// Wire form used in reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChainBreak => "chain-break",
            Self::Tamper => "tamper",
            Self::Version => "version",
            Self::OrphanOutcome => "orphan-outcome",
            Self::BoundMismatch => "bound-mismatch",
            Self::Signature => "signature",
            Self::CanonicalForm => "canonical-form",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First failure found by verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationFailure {
    /// Zero-based position of the offending entry.
    pub position: u64,
    /// Failure kind.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub detail: String,
}

impl VerificationFailure {
    /// Builds a failure record.
    #[must_use]
    pub fn new(position: u64, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            position,
            kind,
            detail: detail.into(),
        }
    }
}

/// Structured verification result.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    /// True when the whole chain verified.
    pub ok: bool,
    /// Entries examined (including the failing one, if any).
    pub entries: u64,
    /// First failure, when not ok.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<VerificationFailure>,
    /// Signatures checked; present only when a public key was supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures_checked: Option<u64>,
}

/// One stored entry handed to the validator by a backend.
#[derive(Debug)]
pub(crate) struct ParsedEntry {
    /// The parsed entry object.
    pub entry: Map,
    /// The stored bytes, for canonical-form comparison.
    pub raw: String,
    /// Zero-based position.
    pub position: u64,
    /// Denormalized hash column (relational backend only).
    pub row_entry_hash: Option<String>,
    /// Denormalized previous-hash column (relational backend only).
    pub row_prev_hash: Option<String>,
}

fn field<'a>(entry: &'a Map, key: &str) -> Option<&'a Value> {
    entry.get(key)
}

fn str_field<'a>(entry: &'a Map, key: &str) -> Option<&'a str> {
    entry.get(key).and_then(Value::as_str)
}

/// Validates a stream of parsed entries, stopping at the first failure.
///
/// Backends yield `Err` for storage-level problems (unparseable rows, torn
/// trailing lines) so those surface with the same position/kind reporting.
pub(crate) fn validate_entries<I>(
    entries: I,
    public_key: Option<&VerifyingKey>,
) -> VerificationReport
where
    I: IntoIterator<Item = Result<ParsedEntry, VerificationFailure>>,
{
    let mut expected_prev: Option<String> = None;
    let mut seen_decisions: std::collections::HashMap<String, String> =
        std::collections::HashMap::new();
    let mut count: u64 = 0;
    let mut signatures_checked: u64 = 0;

    let finish = |count: u64, signatures_checked: u64, failure: Option<VerificationFailure>| {
        VerificationReport {
            ok: failure.is_none(),
            entries: count,
            first_failure: failure,
            signatures_checked: public_key.map(|_| signatures_checked),
        }
    };

    for item in entries {
        let parsed = match item {
            Ok(parsed) => parsed,
            Err(failure) => {
                return finish(count + 1, signatures_checked, Some(failure));
            }
        };
        count += 1;
        let position = parsed.position;
        let entry = &parsed.entry;
        let fail = |kind: FailureKind, detail: &str| {
            Some(VerificationFailure::new(position, kind, detail))
        };

        // Stored bytes must be the canonical encoding of the entry.
        match canonical::to_canonical_json(&Value::Object(entry.clone())) {
            Ok(rendered) if rendered == parsed.raw => {}
            Ok(_) => {
                return finish(
                    count,
                    signatures_checked,
                    fail(FailureKind::CanonicalForm, "stored bytes are not canonical"),
                );
            }
            Err(err) => {
                return finish(
                    count,
                    signatures_checked,
                    fail(FailureKind::CanonicalForm, &err.to_string()),
                );
            }
        }

        if str_field(entry, "schema_version") != Some(SCHEMA_VERSION) {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::Version, "schema_version mismatch"),
            );
        }
        if str_field(entry, "ledger_version") != Some(LEDGER_VERSION) {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::Version, "ledger_version mismatch"),
            );
        }

        let event = str_field(entry, "event");
        if event != Some("decision") && event != Some("outcome") {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::CanonicalForm, "event type invalid"),
            );
        }
        let Some(request_id) = str_field(entry, "request_id") else {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::CanonicalForm, "request_id missing"),
            );
        };

        // Chain linkage.
        let prev = match field(entry, "prev_entry_hash") {
            Some(Value::Null) | None => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(_) => {
                return finish(
                    count,
                    signatures_checked,
                    fail(FailureKind::CanonicalForm, "prev_entry_hash type invalid"),
                );
            }
        };
        if prev != expected_prev {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::ChainBreak, "prev_entry_hash mismatch"),
            );
        }

        // Entry hash over the nulled entry.
        let Some(actual_hash) = str_field(entry, "entry_hash").map(str::to_string) else {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::CanonicalForm, "entry_hash missing"),
            );
        };
        let mut nulled = entry.clone();
        nulled.insert("entry_hash".to_string(), Value::Null);
        nulled.insert("entry_signature".to_string(), Value::Null);
        let recomputed = match canonical::canonical_sha256_hex(&Value::Object(nulled)) {
            Ok(hash) => hash,
            Err(err) => {
                return finish(
                    count,
                    signatures_checked,
                    fail(FailureKind::CanonicalForm, &err.to_string()),
                );
            }
        };
        if recomputed != actual_hash {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::Tamper, "entry_hash mismatch"),
            );
        }

        // Denormalized columns must agree with the body.
        if let Some(row_hash) = &parsed.row_entry_hash {
            if *row_hash != actual_hash {
                return finish(
                    count,
                    signatures_checked,
                    fail(FailureKind::Tamper, "entry_hash column mismatch"),
                );
            }
        }
        if let Some(row_prev) = &parsed.row_prev_hash {
            if Some(row_prev.as_str()) != prev.as_deref() {
                return finish(
                    count,
                    signatures_checked,
                    fail(FailureKind::Tamper, "prev_entry_hash column mismatch"),
                );
            }
        }
        if parsed.row_prev_hash.is_none() && parsed.row_entry_hash.is_some() && prev.is_some() {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::Tamper, "prev_entry_hash column missing"),
            );
        }

        // Signatures are checked only when a key is supplied.
        if let Some(key) = public_key {
            let Some(signature) = str_field(entry, "entry_signature") else {
                return finish(
                    count,
                    signatures_checked,
                    fail(FailureKind::Signature, "entry_signature missing"),
                );
            };
            if !verify_entry_hash(key, &actual_hash, signature) {
                return finish(
                    count,
                    signatures_checked,
                    fail(FailureKind::Signature, "entry_signature invalid"),
                );
            }
            signatures_checked += 1;
        }

        // Decision/outcome binding discipline.
        let Some(decision_block) = field(entry, "decision").and_then(Value::as_object) else {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::CanonicalForm, "decision block missing"),
            );
        };
        let Some(decision_hash) = str_field(decision_block, "decision_hash") else {
            return finish(
                count,
                signatures_checked,
                fail(FailureKind::CanonicalForm, "decision_hash missing"),
            );
        };

        if event == Some("decision") {
            let created_at = str_field(entry, "created_at").unwrap_or_default();
            let action = str_field(entry, "action").unwrap_or_default();
            let agent_id = str_field(entry, "agent_id").unwrap_or("unknown");
            let policy_hash = str_field(decision_block, "policy_hash").unwrap_or_default();
            let parameters = field(entry, "parameters").cloned().unwrap_or(Value::Null);
            let derived = compute_decision_hash(
                request_id,
                created_at,
                policy_hash,
                action,
                &parameters,
                agent_id,
            );
            match derived {
                Ok(derived) if derived == decision_hash => {}
                Ok(_) => {
                    return finish(
                        count,
                        signatures_checked,
                        fail(FailureKind::Tamper, "decision_hash mismatch"),
                    );
                }
                Err(err) => {
                    return finish(
                        count,
                        signatures_checked,
                        fail(FailureKind::CanonicalForm, &err.to_string()),
                    );
                }
            }
            if seen_decisions
                .insert(decision_hash.to_string(), request_id.to_string())
                .is_some()
            {
                return finish(
                    count,
                    signatures_checked,
                    fail(FailureKind::BoundMismatch, "duplicate decision_hash"),
                );
            }
        } else {
            match seen_decisions.get(decision_hash) {
                None => {
                    return finish(
                        count,
                        signatures_checked,
                        fail(FailureKind::OrphanOutcome, "decision_hash unknown"),
                    );
                }
                Some(bound_request) if bound_request != request_id => {
                    return finish(
                        count,
                        signatures_checked,
                        fail(FailureKind::BoundMismatch, "request_id mismatch"),
                    );
                }
                Some(_) => {}
            }
        }

        expected_prev = Some(actual_hash);
    }

    finish(count, signatures_checked, None)
}
