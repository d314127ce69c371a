//! Core identifier types for Quire
//!
//! All identifiers are 32-byte values. They are shown in logs with a short
//! prefix and exchanged in full as base58.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

macro_rules! id32 {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Create from raw bytes
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Convert to base58 string for display/storage
            pub fn to_base58(&self) -> String {
                bs58::encode(&self.0).into_string()
            }

            /// Parse from base58 string
            pub fn from_base58(s: &str) -> Result<Self, SyncError> {
                let bytes = bs58::decode(s).into_vec().map_err(|e| {
                    SyncError::Serialization(format!("Invalid {}: {}", stringify!($name), e))
                })?;
                let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
                    SyncError::Serialization(format!(
                        "Invalid {}: expected 32 bytes, got {}",
                        stringify!($name),
                        v.len()
                    ))
                })?;
                Ok(Self(arr))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, bs58::encode(&self.0[..8]).into_string())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

id32!(
    /// Public key identifying one writer's append-only log.
    ///
    /// Logs are never shared between writers.
    WriterKey,
    "w_"
);

id32!(
    /// Public identifier for a group, used for rendezvous.
    ///
    /// Derived from the replication key; does not reveal content.
    DiscoveryKey,
    "dk_"
);

id32!(
    /// Transport-authenticated identifier of a remote peer
    PeerId,
    "peer_"
);

id32!(
    /// BLAKE3 hash of an entry's canonical plaintext body
    ContentDigest,
    "cd_"
);

/// A position in one writer's log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition {
    pub writer: WriterKey,
    pub index: u64,
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.writer, self.index)
    }
}
