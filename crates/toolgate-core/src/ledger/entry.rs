//! Chain-hash preparation shared by both backends.

use crate::canonical::{self, Map, Value};
use crate::crypto::{SigningKey, sign_entry_hash};

use super::LedgerError;

/// Computes chain fields for an incoming entry.
///
/// Sets `prev_entry_hash`, computes `entry_hash` over the canonical entry
/// with `entry_hash` and `entry_signature` nulled, signs when a key is
/// configured, and returns the finished canonical line together with the
/// entry hash. This is the single source of truth for chain hashing.
///
/// # Errors
///
/// Returns canonical-encoding or signing failures; nothing is written.
pub fn prepare_entry(
    mut entry: Map,
    prev_hash: Option<&str>,
    signing_key: Option<&SigningKey>,
) -> Result<(String, String), LedgerError> {
    entry.insert(
        "prev_entry_hash".to_string(),
        prev_hash.map_or(Value::Null, Value::string),
    );
    entry.insert("entry_hash".to_string(), Value::Null);
    entry.insert("entry_signature".to_string(), Value::Null);

    let entry_hash = canonical::canonical_sha256_hex(&Value::Object(entry.clone()))?;
    entry.insert("entry_hash".to_string(), Value::string(&entry_hash));
    if let Some(key) = signing_key {
        let signature = sign_entry_hash(key, &entry_hash)?;
        entry.insert("entry_signature".to_string(), Value::string(signature));
    }

    let line = canonical::to_canonical_json(&Value::Object(entry))?;
    Ok((line, entry_hash))
}

/// Computes the decision hash bound by approvals and outcome entries.
///
/// The hash covers exactly the canonical object
/// `{version, request_id, decision_at, policy_hash, intent, resource,
/// parameters, actor}`; any change to one of those fields changes it.
///
/// # Errors
///
/// Propagates canonical-encoding failures.
pub fn compute_decision_hash(
    request_id: &str,
    decision_at: &str,
    policy_hash: &str,
    action: &str,
    parameters: &Value,
    agent_id: &str,
) -> Result<String, LedgerError> {
    let mut resource = Map::new();
    resource.insert("type".to_string(), Value::string("function"));
    resource.insert("name".to_string(), Value::string(action));

    let mut actor = Map::new();
    actor.insert("principal".to_string(), Value::string(agent_id));
    actor.insert("source".to_string(), Value::string("sdk"));

    let mut payload = Map::new();
    payload.insert("version".to_string(), Value::string("2.0"));
    payload.insert("request_id".to_string(), Value::string(request_id));
    payload.insert("decision_at".to_string(), Value::string(decision_at));
    payload.insert("policy_hash".to_string(), Value::string(policy_hash));
    payload.insert("intent".to_string(), Value::string(action));
    payload.insert("resource".to_string(), Value::Object(resource));
    payload.insert("parameters".to_string(), parameters.clone());
    payload.insert("actor".to_string(), Value::Object(actor));

    Ok(canonical::canonical_sha256_hex(&Value::Object(payload))?)
}
