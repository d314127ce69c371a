//! Groups: the local view of one collaborative space
//!
//! A [`Group`] bundles the shared [`GroupKeys`], this node's writer key pair
//! for the group, and the [`LogStore`] holding every writer's log.

pub mod keys;
pub mod registry;

use std::sync::Arc;

pub use keys::{derive_discovery_key, GroupKeyMaterial, GroupKeys};
pub use registry::{GroupRecord, GroupRegistry};

use crate::error::SyncResult;
use crate::identity::Keypair;
use crate::invite::NodeAddrBytes;
use crate::log::{EntryBody, LogEntry, LogStore};
use crate::types::{DiscoveryKey, WriterKey};

/// One replicated group as seen by this node
#[derive(Debug)]
pub struct Group {
    keys: Arc<GroupKeys>,
    writer: Keypair,
    store: Arc<LogStore>,
    bootstrap: Vec<NodeAddrBytes>,
}

impl Group {
    pub fn new(writer: Keypair, store: Arc<LogStore>) -> Self {
        Self {
            keys: store.keys().clone(),
            writer,
            store,
            bootstrap: Vec::new(),
        }
    }

    /// Peers to contact first when joining the swarm
    pub fn with_bootstrap(mut self, bootstrap: Vec<NodeAddrBytes>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn bootstrap(&self) -> &[NodeAddrBytes] {
        &self.bootstrap
    }

    /// A group whose logs live only in memory
    pub fn in_memory(keys: GroupKeys, writer: Keypair, update_capacity: usize) -> SyncResult<Self> {
        let store = LogStore::in_memory(Arc::new(keys), update_capacity)?;
        Ok(Self::new(writer, Arc::new(store)))
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.keys.discovery_key()
    }

    pub fn keys(&self) -> &Arc<GroupKeys> {
        &self.keys
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// This node's writer identity in the group
    pub fn writer_key(&self) -> WriterKey {
        self.writer.writer_key()
    }

    pub fn writer(&self) -> &Keypair {
        &self.writer
    }

    /// Append to this node's own log; subscribed sessions offer it to peers.
    pub fn append(&self, body: &EntryBody) -> SyncResult<LogEntry> {
        self.store.append(&self.writer, body)
    }
}
