//! Ed25519 signing over entry hashes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use thiserror::Error;

/// Errors from signing operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SigningError {
    /// The entry hash was not 64 lowercase hex characters.
    #[error("entry hash is not a valid sha-256 hex digest")]
    InvalidEntryHash,
}

/// Signs an entry hash, returning the base64 signature.
///
/// The signed message is the hex-decoded 32-byte digest, not the hex text.
///
/// # Errors
///
/// Returns [`SigningError::InvalidEntryHash`] when the hash does not decode
/// to 32 bytes.
pub fn sign_entry_hash(key: &SigningKey, entry_hash: &str) -> Result<String, SigningError> {
    let digest = decode_entry_hash(entry_hash)?;
    let signature = key.sign(&digest);
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Verifies a base64 signature over an entry hash.
///
/// Any malformed input verifies as `false`; verification never panics.
#[must_use]
pub fn verify_entry_hash(key: &VerifyingKey, entry_hash: &str, signature_b64: &str) -> bool {
    let Ok(digest) = decode_entry_hash(entry_hash) else {
        return false;
    };
    let Ok(raw) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(raw) = <[u8; 64]>::try_from(raw) else {
        return false;
    };
    let signature = Signature::from_bytes(&raw);
    key.verify(&digest, &signature).is_ok()
}

fn decode_entry_hash(entry_hash: &str) -> Result<[u8; 32], SigningError> {
    let raw = hex::decode(entry_hash).map_err(|_| SigningError::InvalidEntryHash)?;
    raw.try_into().map_err(|_| SigningError::InvalidEntryHash)
}
