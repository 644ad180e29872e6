//! Signing primitives for ledger entries.
//!
//! Entries are optionally signed with Ed25519. The signature covers the raw
//! 32 bytes of the hex-decoded `entry_hash`, so a signature binds exactly
//! one chained entry. Keys are opaque to the engine: a ledger configured
//! without a key writes unsigned entries, and verification accepts unsigned
//! ledgers unless a public key is supplied.

mod keys;
mod sign;

#[cfg(test)]
mod tests;

pub use keys::{KeyError, generate_keypair, load_signing_key, load_verifying_key, write_keypair};
pub use sign::{SigningError, sign_entry_hash, verify_entry_hash};

pub use ed25519_dalek::{SigningKey, VerifyingKey};
