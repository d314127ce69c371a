//! Replication events for observers

use crate::types::{DiscoveryKey, PeerId, WriterKey};

/// Events emitted by the swarm and its sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Started replicating a group
    Joined { discovery_key: DiscoveryKey },

    /// Stopped replicating a group
    Left { discovery_key: DiscoveryKey },

    /// A session completed its handshake
    PeerConnected {
        discovery_key: DiscoveryKey,
        peer: PeerId,
    },

    /// A session closed
    PeerDisconnected {
        discovery_key: DiscoveryKey,
        peer: PeerId,
        /// Why the session ended, if it did not end cleanly
        reason: Option<String>,
    },

    /// An entry from a peer was verified and stored
    EntryStored {
        discovery_key: DiscoveryKey,
        writer: WriterKey,
        index: u64,
    },

    /// An entry from a peer failed validation and was discarded
    InvalidEntry {
        discovery_key: DiscoveryKey,
        peer: PeerId,
        writer: WriterKey,
        index: u64,
        reason: String,
    },

    /// A peer reported that an entry we sent failed its validation
    PeerReportedInvalid {
        discovery_key: DiscoveryKey,
        peer: PeerId,
        writer: WriterKey,
        index: u64,
        reason: String,
    },
}

impl SyncEvent {
    /// Group this event belongs to
    pub fn discovery_key(&self) -> &DiscoveryKey {
        match self {
            SyncEvent::Joined { discovery_key }
            | SyncEvent::Left { discovery_key }
            | SyncEvent::PeerConnected { discovery_key, .. }
            | SyncEvent::PeerDisconnected { discovery_key, .. }
            | SyncEvent::EntryStored { discovery_key, .. }
            | SyncEvent::InvalidEntry { discovery_key, .. }
            | SyncEvent::PeerReportedInvalid { discovery_key, .. } => discovery_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_key_accessor() {
        let dk = DiscoveryKey([5; 32]);
        let event = SyncEvent::EntryStored {
            discovery_key: dk,
            writer: WriterKey([1; 32]),
            index: 0,
        };
        assert_eq!(event.discovery_key(), &dk);
    }
}
