use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use infomesh_core::Action;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {got}")]
    KeyLength { expected: usize, got: usize },
    #[error("invalid signature length: expected {expected}, got {got}")]
    SignatureLength { expected: usize, got: usize },
    #[error("malformed key material: {0}")]
    Malformed(String),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// An Ed25519 keypair held in memory. Not zeroized — callers handling
/// long-lived node identities should wrap this behind their own secret
/// storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub public_key: [u8; 32],
    pub secret_key: [u8; 32],
}

impl KeyMaterial {
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key)
    }
}

/// Generate a fresh Ed25519 identity keypair.
pub fn generate_ed25519() -> KeyMaterial {
    let signing = SigningKey::generate(&mut OsRng);
    KeyMaterial {
        public_key: signing.verifying_key().to_bytes(),
        secret_key: signing.to_bytes(),
    }
}

/// Build the canonical byte encoding for a credit entry. This is the
/// single cross-language wire contract every peer must reproduce
/// identically: `"{action}|{quantity}|{weight}|{multiplier}|{credits}|{timestamp}|{note}"`.
///
/// Numbers are formatted with Rust's default `f64` `Display`, which
/// already produces the shortest round-trip decimal representation —
/// this is pinned as the canonical formatting rule.
pub fn canonical_entry_bytes(
    action: Action,
    quantity: f64,
    weight: f64,
    multiplier: f64,
    credits: f64,
    timestamp: f64,
    note: &str,
) -> Vec<u8> {
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        action.as_str(),
        quantity,
        weight,
        multiplier,
        credits,
        timestamp,
        note
    )
    .into_bytes()
}

/// Build the canonical byte encoding signed over a Merkle proof root:
/// `"{merkle_root}|{entry_count}|{peer_id}"`.
pub fn canonical_root_bytes(merkle_root: &str, entry_count: usize, peer_id: &str) -> Vec<u8> {
    format!("{merkle_root}|{entry_count}|{peer_id}").into_bytes()
}

/// SHA-256 content hash of arbitrary canonical bytes, hex-encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Sign `bytes` with a raw 32-byte Ed25519 secret key, returning a
/// hex-encoded signature.
pub fn sign_hex(secret_key: &[u8], bytes: &[u8]) -> Result<String, CryptoError> {
    let sk_arr: [u8; 32] = secret_key
        .try_into()
        .map_err(|_| CryptoError::KeyLength { expected: 32, got: secret_key.len() })?;
    let signing = SigningKey::from_bytes(&sk_arr);
    Ok(hex::encode(signing.sign(bytes).to_bytes()))
}

/// Verify a hex-encoded Ed25519 signature over `bytes` against a
/// hex-encoded public key. Returns `Ok(false)` for a well-formed but
/// invalid signature, `Err` only for malformed hex/key/signature input.
pub fn verify_hex(public_key_hex: &str, bytes: &[u8], signature_hex: &str) -> Result<bool, CryptoError> {
    let pk_bytes = hex::decode(public_key_hex)?;
    let pk_arr: [u8; 32] = pk_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::KeyLength { expected: 32, got: pk_bytes.len() })?;
    let vk = VerifyingKey::from_bytes(&pk_arr)
        .map_err(|e| CryptoError::Malformed(e.to_string()))?;

    let sig_bytes = hex::decode(signature_hex)?;
    let sig_arr: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::SignatureLength { expected: 64, got: sig_bytes.len() })?;
    let signature = Signature::from_bytes(&sig_arr);

    Ok(vk.verify(bytes, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bytes_match_contract_format() {
        let bytes = canonical_entry_bytes(Action::Crawl, 10.0, 1.0, 1.5, 15.0, 1700000000.0, "note");
        assert_eq!(bytes, b"crawl|10|1|1.5|15|1700000000|note".to_vec());
    }

    #[test]
    fn canonical_root_bytes_match_contract_format() {
        let bytes = canonical_root_bytes("abc123", 4, "peer-1");
        assert_eq!(bytes, b"abc123|4|peer-1".to_vec());
    }

    #[test]
    fn content_hash_is_sha256() {
        let hash = content_hash(b"hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keys = generate_ed25519();
        let msg = b"credit entry bytes";
        let sig = sign_hex(&keys.secret_key, msg).unwrap();
        assert!(verify_hex(&keys.public_key_hex(), msg, &sig).unwrap());
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let keys = generate_ed25519();
        let msg = b"credit entry bytes";
        let mut sig = sign_hex(&keys.secret_key, msg).unwrap();
        sig.replace_range(0..2, "ff");
        assert!(!verify_hex(&keys.public_key_hex(), msg, &sig).unwrap());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let keys = generate_ed25519();
        let other = generate_ed25519();
        let msg = b"credit entry bytes";
        let sig = sign_hex(&keys.secret_key, msg).unwrap();
        assert!(!verify_hex(&other.public_key_hex(), msg, &sig).unwrap());
    }

    #[test]
    fn key_material_round_trips_through_json() {
        let keys = generate_ed25519();
        let text = serde_json::to_string(&keys).unwrap();
        let restored: KeyMaterial = serde_json::from_str(&text).unwrap();
        assert_eq!(restored.public_key, keys.public_key);
        assert_eq!(restored.secret_key, keys.secret_key);
    }
}
