//! Group key material
//!
//! A group is defined by three secrets shared out of band:
//!
//! - the **replication key** (group secret), from which the public
//!   [`DiscoveryKey`] is derived and which keys the handshake MAC,
//! - the **encryption key** for entry bodies,
//! - the **group signing key pair** that countersigns every envelope.

use serde::{Deserialize, Serialize};

use crate::crypto::GroupCrypto;
use crate::identity::Keypair;
use crate::types::{DiscoveryKey, PeerId};

/// Domain prefix for discovery key derivation
const DISCOVERY_KEY_PREFIX: &[u8] = b"quire/discovery/v1:";

/// Domain prefix for handshake proofs
const HANDSHAKE_PREFIX: &[u8] = b"quire/handshake/v1:";

/// Derive the public discovery key from a replication key.
pub fn derive_discovery_key(replication_key: &[u8; 32]) -> DiscoveryKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DISCOVERY_KEY_PREFIX);
    hasher.update(replication_key);
    DiscoveryKey(*hasher.finalize().as_bytes())
}

/// Secret material for one group.
#[derive(Clone)]
pub struct GroupKeys {
    replication_key: [u8; 32],
    encryption_key: [u8; 32],
    group_keypair: Keypair,
    discovery_key: DiscoveryKey,
}

impl GroupKeys {
    /// Generate fresh keys for a new group
    pub fn generate() -> Self {
        Self::from_parts(
            GroupCrypto::generate_key(),
            GroupCrypto::generate_key(),
            Keypair::generate().secret_bytes(),
        )
    }

    /// Assemble keys from their raw parts; the discovery key is derived.
    pub fn from_parts(
        replication_key: [u8; 32],
        encryption_key: [u8; 32],
        group_secret_key: [u8; 32],
    ) -> Self {
        Self {
            discovery_key: derive_discovery_key(&replication_key),
            replication_key,
            encryption_key,
            group_keypair: Keypair::from_secret_bytes(&group_secret_key),
        }
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    pub fn replication_key(&self) -> &[u8; 32] {
        &self.replication_key
    }

    pub fn encryption_key(&self) -> &[u8; 32] {
        &self.encryption_key
    }

    pub fn group_keypair(&self) -> &Keypair {
        &self.group_keypair
    }

    /// Public half of the group signing key pair
    pub fn group_public_key(&self) -> [u8; 32] {
        self.group_keypair.public_bytes()
    }

    /// Cipher for entry bodies
    pub fn crypto(&self) -> GroupCrypto {
        GroupCrypto::new(&self.encryption_key)
    }

    /// MAC proving knowledge of the replication key.
    ///
    /// Binds the discovery key, the sender's transport identity, and a fresh
    /// nonce, so a proof is only valid from the peer that produced it.
    pub fn handshake_proof(&self, sender: &PeerId, nonce: &[u8; 32]) -> [u8; 32] {
        let mut data = Vec::with_capacity(HANDSHAKE_PREFIX.len() + 96);
        data.extend_from_slice(HANDSHAKE_PREFIX);
        data.extend_from_slice(self.discovery_key.as_bytes());
        data.extend_from_slice(sender.as_bytes());
        data.extend_from_slice(nonce);
        *blake3::keyed_hash(&self.replication_key, &data).as_bytes()
    }

    /// Check a peer's handshake proof in constant time
    pub fn verify_handshake_proof(&self, sender: &PeerId, nonce: &[u8; 32], proof: &[u8]) -> bool {
        let Ok(proof) = <[u8; 32]>::try_from(proof) else {
            return false;
        };
        blake3::Hash::from(self.handshake_proof(sender, nonce)) == blake3::Hash::from(proof)
    }

    /// Export the raw secrets for persistence or a join link
    pub fn to_material(&self) -> GroupKeyMaterial {
        GroupKeyMaterial {
            replication_key: self.replication_key,
            encryption_key: self.encryption_key,
            group_secret_key: self.group_keypair.secret_bytes(),
        }
    }
}

impl std::fmt::Debug for GroupKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKeys")
            .field("discovery_key", &self.discovery_key)
            .finish_non_exhaustive()
    }
}

/// Serializable form of [`GroupKeys`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeyMaterial {
    pub replication_key: [u8; 32],
    pub encryption_key: [u8; 32],
    pub group_secret_key: [u8; 32],
}

impl From<GroupKeyMaterial> for GroupKeys {
    fn from(m: GroupKeyMaterial) -> Self {
        GroupKeys::from_parts(m.replication_key, m.encryption_key, m.group_secret_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_key_is_deterministic() {
        let keys = GroupKeys::generate();
        let again: GroupKeys = keys.to_material().into();
        assert_eq!(keys.discovery_key(), again.discovery_key());
        assert_eq!(keys.discovery_key(), derive_discovery_key(keys.replication_key()));
    }

    #[test]
    fn test_discovery_key_does_not_reveal_secret() {
        let keys = GroupKeys::generate();
        assert_ne!(keys.discovery_key().as_bytes(), keys.replication_key());
    }

    #[test]
    fn test_handshake_proof_verifies() {
        let keys = GroupKeys::generate();
        let peer = PeerId([3; 32]);
        let nonce = [9; 32];

        let proof = keys.handshake_proof(&peer, &nonce);
        assert!(keys.verify_handshake_proof(&peer, &nonce, &proof));
    }

    #[test]
    fn test_handshake_proof_bound_to_sender() {
        let keys = GroupKeys::generate();
        let nonce = [9; 32];

        let proof = keys.handshake_proof(&PeerId([3; 32]), &nonce);
        assert!(!keys.verify_handshake_proof(&PeerId([4; 32]), &nonce, &proof));
    }

    #[test]
    fn test_handshake_proof_requires_replication_key() {
        let keys = GroupKeys::generate();
        let other = GroupKeys::generate();
        let peer = PeerId([3; 32]);
        let nonce = [1; 32];

        let proof = other.handshake_proof(&peer, &nonce);
        assert!(!keys.verify_handshake_proof(&peer, &nonce, &proof));
        assert!(!keys.verify_handshake_proof(&peer, &nonce, &proof[..16]));
    }
}
