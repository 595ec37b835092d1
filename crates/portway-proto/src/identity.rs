//! Server host-key identity
//!
//! The server's identity is an ed25519 keypair derived deterministically
//! from the configured `key_seed`, so the fingerprint survives restarts.
//! During the handshake the server signs the agent's hello nonce; the agent
//! verifies the signature and compares the key fingerprint against its
//! pinned value (full string or prefix).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;

const KEY_DERIVATION_CONTEXT: &[u8] = b"portway host key v1";

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid host key: {0}")]
    InvalidKey(String),

    #[error("host key signature verification failed")]
    BadSignature,

    #[error("fingerprint mismatch: expected prefix {expected:?}, got {actual:?}")]
    FingerprintMismatch { expected: String, actual: String },
}

/// The server's host key.
pub struct HostIdentity {
    signing_key: SigningKey,
}

impl HostIdentity {
    /// Derive the keypair from `key_seed`. The same seed always produces the
    /// same key.
    pub fn from_seed(key_seed: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DERIVATION_CONTEXT);
        hasher.update(key_seed.as_bytes());
        let seed: [u8; 32] = hasher.finalize().into();
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// `SHA256:<base64>` fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_key())
    }

    pub fn sign(&self, nonce: &[u8]) -> Vec<u8> {
        self.signing_key.sign(nonce).to_bytes().to_vec()
    }
}

/// Fingerprint of a raw ed25519 public key.
pub fn fingerprint_of(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// Fresh random hello nonce.
pub fn hello_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Verify the server hello: the signature must cover the nonce we sent, and
/// when a pin is configured the key fingerprint must start with it.
pub fn verify_server_hello(
    public_key: &[u8; 32],
    signature: &[u8],
    nonce: &[u8; 32],
    pinned_fingerprint: Option<&str>,
) -> Result<String, IdentityError> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
    let signature =
        Signature::from_slice(signature).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;

    verifying_key
        .verify(nonce, &signature)
        .map_err(|_| IdentityError::BadSignature)?;

    let actual = fingerprint_of(public_key);
    if let Some(pin) = pinned_fingerprint {
        if !pin.is_empty() && !actual.starts_with(pin) {
            return Err(IdentityError::FingerprintMismatch {
                expected: pin.to_string(),
                actual,
            });
        }
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let a = HostIdentity::from_seed("seed-1");
        let b = HostIdentity::from_seed("seed-1");
        let c = HostIdentity::from_seed("seed-2");

        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn fingerprint_format() {
        let identity = HostIdentity::from_seed("seed");
        let fp = identity.fingerprint();
        assert!(fp.starts_with("SHA256:"));
        assert!(fp.len() > 40);
    }

    #[test]
    fn signed_nonce_verifies() {
        let identity = HostIdentity::from_seed("seed");
        let nonce = hello_nonce();
        let sig = identity.sign(&nonce);

        let fp = verify_server_hello(&identity.public_key(), &sig, &nonce, None).unwrap();
        assert_eq!(fp, identity.fingerprint());
    }

    #[test]
    fn pin_prefix_matches() {
        let identity = HostIdentity::from_seed("seed");
        let nonce = hello_nonce();
        let sig = identity.sign(&nonce);
        let full = identity.fingerprint();
        let prefix = &full[..16];

        assert!(
            verify_server_hello(&identity.public_key(), &sig, &nonce, Some(prefix)).is_ok()
        );
        assert!(
            verify_server_hello(&identity.public_key(), &sig, &nonce, Some(&full)).is_ok()
        );
    }

    #[test]
    fn wrong_pin_is_rejected() {
        let identity = HostIdentity::from_seed("seed");
        let nonce = hello_nonce();
        let sig = identity.sign(&nonce);

        let err = verify_server_hello(&identity.public_key(), &sig, &nonce, Some("SHA256:nope"))
            .unwrap_err();
        assert!(matches!(err, IdentityError::FingerprintMismatch { .. }));
    }

    #[test]
    fn tampered_nonce_is_rejected() {
        let identity = HostIdentity::from_seed("seed");
        let nonce = hello_nonce();
        let sig = identity.sign(&nonce);

        let mut other = nonce;
        other[0] ^= 0xff;
        let err = verify_server_hello(&identity.public_key(), &sig, &other, None).unwrap_err();
        assert!(matches!(err, IdentityError::BadSignature));
    }
}
