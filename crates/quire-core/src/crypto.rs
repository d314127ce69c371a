//! Encryption layer using ChaCha20-Poly1305 AEAD
//!
//! Entry bodies are encrypted under the group's encryption key. The nonce is
//! carried separately in the envelope, so only the explicit-nonce API exists.

use crate::error::SyncError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// Encryption utilities for group data using ChaCha20-Poly1305 AEAD.
///
/// # Wire Format
///
/// Ciphertext format: `[ciphertext + auth_tag (16 bytes)]`; the 12-byte
/// nonce travels next to it in the envelope.
pub struct GroupCrypto {
    cipher: ChaCha20Poly1305,
}

impl GroupCrypto {
    /// Create a new GroupCrypto instance with the given 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt data using a provided nonce.
    ///
    /// The nonce must be unique per key.
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt data using a provided nonce.
    ///
    /// Fails on a wrong key, tampered data, or malformed input.
    pub fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(SyncError::Crypto(
                "Data too short to contain auth tag".to_string(),
            ));
        }
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SyncError::Crypto(format!("Decryption failed: {}", e)))
    }
}
