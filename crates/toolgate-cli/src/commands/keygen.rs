//! `toolgate keygen` - Ed25519 key pair generation.

use std::path::Path;

use toolgate_core::crypto::{KeyError, write_keypair};

/// Generates and writes a key pair.
pub fn run(private_key: &Path, public_key: &Path, overwrite: bool) -> anyhow::Result<u8> {
    match write_keypair(private_key, public_key, overwrite) {
        Ok(()) => {
            println!("wrote {}", private_key.display());
            println!("wrote {}", public_key.display());
            Ok(0)
        }
        Err(KeyError::AlreadyExists { path }) => {
            eprintln!("key file already exists: {path} (use --overwrite)");
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}
