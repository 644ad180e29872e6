//! Tests for signing and key storage.

use std::os::unix::fs::PermissionsExt;

use tempfile::TempDir;

use super::*;

const ENTRY_HASH: &str = "d3626ac30a87e6f7a6428233b3c68299976865fa5508e4267c5415c76af7a772";

#[test]
fn sign_then_verify_round_trip() {
    let (signing_key, verifying_key) = generate_keypair();
    let signature = sign_entry_hash(&signing_key, ENTRY_HASH).expect("sign");
    assert!(verify_entry_hash(&verifying_key, ENTRY_HASH, &signature));
}

#[test]
fn verify_rejects_wrong_hash_and_wrong_key() {
    let (signing_key, verifying_key) = generate_keypair();
    let (_, other_key) = generate_keypair();
    let signature = sign_entry_hash(&signing_key, ENTRY_HASH).expect("sign");

    let mut flipped = ENTRY_HASH.to_string();
    flipped.replace_range(0..1, "e");
    assert!(!verify_entry_hash(&verifying_key, &flipped, &signature));
    assert!(!verify_entry_hash(&other_key, ENTRY_HASH, &signature));
    assert!(!verify_entry_hash(&verifying_key, ENTRY_HASH, "not-base64!"));
}

#[test]
fn sign_rejects_non_hex_hash() {
    let (signing_key, _) = generate_keypair();
    assert!(sign_entry_hash(&signing_key, "zz").is_err());
    assert!(sign_entry_hash(&signing_key, "abcd").is_err());
}

#[test]
fn keypair_files_round_trip() {
    let dir = TempDir::new().expect("temp dir");
    let private_path = dir.path().join("keys/ledger.key");
    let public_path = dir.path().join("keys/ledger.pub");

    write_keypair(&private_path, &public_path, false).expect("write keypair");

    let mode = std::fs::metadata(&private_path)
        .expect("metadata")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);

    let signing_key = load_signing_key(&private_path).expect("load private");
    let verifying_key = load_verifying_key(&public_path).expect("load public");
    let signature = sign_entry_hash(&signing_key, ENTRY_HASH).expect("sign");
    assert!(verify_entry_hash(&verifying_key, ENTRY_HASH, &signature));
}

#[test]
fn keygen_refuses_to_clobber_without_overwrite() {
    let dir = TempDir::new().expect("temp dir");
    let private_path = dir.path().join("ledger.key");
    let public_path = dir.path().join("ledger.pub");

    write_keypair(&private_path, &public_path, false).expect("first write");
    let err = write_keypair(&private_path, &public_path, false).unwrap_err();
    assert!(matches!(err, KeyError::AlreadyExists { .. }));
    write_keypair(&private_path, &public_path, true).expect("overwrite");
}

#[test]
fn loose_private_key_permissions_are_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let private_path = dir.path().join("ledger.key");
    let public_path = dir.path().join("ledger.pub");
    write_keypair(&private_path, &public_path, false).expect("write");

    std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o644))
        .expect("chmod");
    let err = load_signing_key(&private_path).unwrap_err();
    assert!(matches!(err, KeyError::InsecurePermissions { .. }));
}
