//! Signed and encrypted log entry envelopes
//!
//! The `Envelope` is the wire and storage form of a [`LogEntry`]. Routing
//! metadata (`discovery_key`, `writer`, `index`) stays in cleartext so peers
//! can deduplicate and route without decrypting.
//!
//! ## Security Model
//!
//! Uses **Encrypt-then-Sign**:
//! 1. Serialize the body canonically (sorted keys)
//! 2. Encrypt with the group's encryption key under a fresh nonce
//! 3. Sign the envelope fields with the writer key
//! 4. Countersign (fields + writer signature) with the group signing key
//!
//! Opening verifies both signatures *before* any decryption is attempted.
//!
//! ## Wire Format
//!
//! ```text
//! +---------+---------------+--------+-------+------------+-------+-----------+-----------------+
//! | version | discovery_key | writer | index | ciphertext | nonce | signature | group_signature |
//! | (1)     | (32)          | (32)   | (u64) | (variable) | (12)  | (64)      | (64)            |
//! +---------+---------------+--------+-------+------------+-------+-----------+-----------------+
//! ```

use serde::{Deserialize, Serialize};

use crate::crypto::{GroupCrypto, NONCE_SIZE};
use crate::error::{SyncError, SyncResult};
use crate::group::keys::GroupKeys;
use crate::identity::{verify_signature, Keypair};
use crate::log::entry::{digest_of, EntryBody, LogEntry};
use crate::types::{DiscoveryKey, LogPosition, WriterKey};

/// Current envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// A signed and encrypted log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Format version for forward compatibility
    pub version: u8,

    /// Group this entry belongs to
    pub discovery_key: DiscoveryKey,

    /// Author of the entry; also the log it belongs to
    pub writer: WriterKey,

    /// Zero-based position in the writer's log
    pub index: u64,

    /// Encrypted canonical body with authentication tag
    pub ciphertext: Vec<u8>,

    /// Nonce used for encryption (12 bytes for ChaCha20-Poly1305)
    pub nonce: [u8; NONCE_SIZE],

    /// Writer signature over the envelope fields
    pub signature: Vec<u8>,

    /// Group key signature over the envelope fields and writer signature
    pub group_signature: Vec<u8>,
}

impl Envelope {
    /// Seal a body as entry `index` of `writer`'s log.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Serialization` if the body cannot be serialized,
    /// or `SyncError::Crypto` if encryption fails.
    pub fn encode(
        body: &EntryBody,
        index: u64,
        writer: &Keypair,
        keys: &GroupKeys,
    ) -> SyncResult<Self> {
        let plaintext = body.canonical_bytes()?;
        let nonce = GroupCrypto::generate_nonce();
        let ciphertext = keys.crypto().encrypt_with_nonce(&plaintext, &nonce)?;

        let mut envelope = Self {
            version: ENVELOPE_VERSION,
            discovery_key: keys.discovery_key(),
            writer: writer.writer_key(),
            index,
            ciphertext,
            nonce,
            signature: Vec::new(),
            group_signature: Vec::new(),
        };

        envelope.signature = writer.sign(&envelope.signed_data());
        envelope.group_signature = keys.group_keypair().sign(&envelope.group_signed_data());

        Ok(envelope)
    }

    /// Verify and open an envelope for the group described by `keys`.
    ///
    /// Either returns a fully decoded entry or `SyncError::Validation`; there
    /// is no partial success. Signatures are checked before decryption.
    pub fn decode(&self, keys: &GroupKeys) -> SyncResult<LogEntry> {
        if self.version != ENVELOPE_VERSION {
            return Err(SyncError::Validation(format!(
                "envelope version {} is not supported",
                self.version
            )));
        }

        if self.discovery_key != keys.discovery_key() {
            return Err(SyncError::Validation(format!(
                "envelope for group {} delivered to group {}",
                self.discovery_key,
                keys.discovery_key()
            )));
        }

        if !self.writer.verify(&self.signed_data(), &self.signature) {
            return Err(SyncError::Validation(format!(
                "bad writer signature on {}",
                self.position()
            )));
        }

        if !verify_signature(
            &keys.group_public_key(),
            &self.group_signed_data(),
            &self.group_signature,
        ) {
            return Err(SyncError::Validation(format!(
                "bad group signature on {}",
                self.position()
            )));
        }

        let plaintext = keys
            .crypto()
            .decrypt_with_nonce(&self.ciphertext, &self.nonce)
            .map_err(|e| SyncError::Validation(format!("{} on {}", e, self.position())))?;

        let body = EntryBody::from_canonical_bytes(&plaintext)?;

        Ok(LogEntry {
            writer: self.writer,
            index: self.index,
            digest: digest_of(&plaintext),
            body,
            envelope: self.clone(),
        })
    }

    /// Get the data covered by the writer signature.
    ///
    /// version || discovery_key || writer || index || ciphertext || nonce
    fn signed_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(1 + 32 + 32 + 8 + 4 + self.ciphertext.len() + NONCE_SIZE);

        data.push(self.version);
        data.extend_from_slice(self.discovery_key.as_bytes());
        data.extend_from_slice(self.writer.as_bytes());
        data.extend_from_slice(&self.index.to_le_bytes());

        // Ciphertext length (4 bytes, little-endian) + ciphertext
        data.extend_from_slice(&(self.ciphertext.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.ciphertext);

        data.extend_from_slice(&self.nonce);

        data
    }

    /// Data covered by the group signature: signed data || writer signature
    fn group_signed_data(&self) -> Vec<u8> {
        let mut data = self.signed_data();
        data.extend_from_slice(&self.signature);
        data
    }

    pub fn position(&self) -> LogPosition {
        LogPosition {
            writer: self.writer,
            index: self.index,
        }
    }

    /// Encode the envelope to bytes for storage.
    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode envelope: {}", e)))
    }

    /// Decode an envelope from bytes.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| SyncError::Serialization(format!("Failed to decode envelope: {}", e)))
    }
}
