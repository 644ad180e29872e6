//! Key generation and PEM storage.
//!
//! Private keys are written as PKCS#8 PEM with `0600` permissions; public
//! keys as SPKI PEM. Loading refuses group/world-readable private keys.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use ed25519_dalek::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey,
};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Errors from key management operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// I/O error reading or writing key files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key file exists and overwrite was not requested.
    #[error("key file already exists: {path}")]
    AlreadyExists {
        /// The existing path.
        path: String,
    },

    /// PEM contents could not be parsed as the expected key type.
    #[error("invalid key format: {message}")]
    InvalidFormat {
        /// Description of the parse failure.
        message: String,
    },

    /// Private key file is readable by group or world.
    #[error("insecure permissions on key file: {path}")]
    InsecurePermissions {
        /// The offending path.
        path: String,
    },
}

/// Generates a fresh Ed25519 keypair.
#[must_use]
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Generates a keypair and writes both PEM files.
///
/// # Errors
///
/// Returns [`KeyError::AlreadyExists`] when a target exists and `overwrite`
/// is false, and I/O or encoding errors otherwise.
pub fn write_keypair(
    private_path: &Path,
    public_path: &Path,
    overwrite: bool,
) -> Result<(), KeyError> {
    if !overwrite {
        for path in [private_path, public_path] {
            if path.exists() {
                return Err(KeyError::AlreadyExists {
                    path: path.display().to_string(),
                });
            }
        }
    }

    let (signing_key, verifying_key) = generate_keypair();
    let private_pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|err| KeyError::InvalidFormat {
            message: err.to_string(),
        })?;
    let public_pem =
        verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| KeyError::InvalidFormat {
                message: err.to_string(),
            })?;

    if let Some(parent) = private_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Some(parent) = public_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut private_file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(private_path)?;
    private_file.write_all(private_pem.as_bytes())?;
    // An existing file keeps its old mode; force 0600 either way.
    fs::set_permissions(private_path, fs::Permissions::from_mode(0o600))?;

    fs::write(public_path, public_pem.as_bytes())?;
    Ok(())
}

/// Loads a PKCS#8 PEM private key, enforcing `0600` permissions.
///
/// # Errors
///
/// Returns [`KeyError::InsecurePermissions`] for group/world-readable
/// files and [`KeyError::InvalidFormat`] for unparseable contents.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, KeyError> {
    let metadata = fs::metadata(path)?;
    if metadata.permissions().mode() & 0o077 != 0 {
        return Err(KeyError::InsecurePermissions {
            path: path.display().to_string(),
        });
    }
    let pem = fs::read_to_string(path)?;
    SigningKey::from_pkcs8_pem(&pem).map_err(|err| KeyError::InvalidFormat {
        message: err.to_string(),
    })
}

/// Loads an SPKI PEM public key.
///
/// # Errors
///
/// Returns [`KeyError::InvalidFormat`] for unparseable contents.
pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey, KeyError> {
    let pem = fs::read_to_string(path)?;
    VerifyingKey::from_public_key_pem(&pem).map_err(|err| KeyError::InvalidFormat {
        message: err.to_string(),
    })
}
