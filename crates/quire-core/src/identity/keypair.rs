//! Ed25519 key pairs

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

use crate::types::WriterKey;

/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 signing key pair.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        // Seed through rand 0.9 to avoid the rand_core version split with ed25519-dalek
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_secret_bytes(&seed)
    }

    /// Restore a key pair from its 32-byte secret seed
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// The 32-byte secret seed
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The 32-byte public key
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The public key viewed as a writer identity
    pub fn writer_key(&self) -> WriterKey {
        WriterKey(self.public_bytes())
    }

    /// Short hex fingerprint of the public key (first 8 bytes)
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public_bytes()[..8])
    }

    /// Sign a message, returning the 64-byte signature
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.writer_key())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature against a raw public key.
///
/// Returns `false` for malformed keys or signatures instead of erroring.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

impl WriterKey {
    /// Verify a signature made by this writer
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.0, message, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"hello");

        assert_eq!(signature.len(), SIGNATURE_SIZE);
        assert!(keypair.writer_key().verify(b"hello", &signature));
        assert!(!keypair.writer_key().verify(b"hello!", &signature));
    }

    #[test]
    fn test_cross_verification_fails() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let signature = alice.sign(b"from alice");
        assert!(!bob.writer_key().verify(b"from alice", &signature));
    }

    #[test]
    fn test_secret_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&keypair.secret_bytes());
        assert_eq!(keypair.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let keypair = Keypair::generate();
        assert!(!keypair.writer_key().verify(b"msg", &[0u8; 10]));
        assert!(!verify_signature(&[0u8; 32], b"msg", &[0u8; 64]));
    }

    #[test]
    fn test_debug_hides_secret() {
        let keypair = Keypair::generate();
        let shown = format!("{:?}", keypair);
        assert!(!shown.contains(&hex::encode(keypair.secret_bytes())));
    }

    #[test]
    fn test_fingerprint_is_public_prefix() {
        let keypair = Keypair::generate();
        let fingerprint = keypair.fingerprint();
        assert_eq!(fingerprint.len(), 16);
        assert!(hex::encode(keypair.public_bytes()).starts_with(&fingerprint));
    }
}
