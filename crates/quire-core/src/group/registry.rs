//! Registry of the groups this node belongs to
//!
//! The registry owns the group records in [`NodeStorage`] and the per-group
//! log databases under `<data_dir>/groups/<discovery key>.redb`. Open groups
//! are cached so every caller shares one [`LogStore`] per group, which keeps
//! local appends and replication sessions on the same change feed.
//!
//! Leaving a group deletes its log database and secrets but keeps the record
//! as a tombstone. Joining again through a link revives it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::error::{SyncError, SyncResult};
use crate::group::{Group, GroupKeys};
use crate::identity::Keypair;
use crate::invite::{JoinLink, NodeAddrBytes};
use crate::log::{EntryBody, LogEntry, LogStore};
use crate::storage::NodeStorage;
use crate::types::DiscoveryKey;

/// File name of the node database inside the data directory
pub const NODE_DB_FILE: &str = "node.redb";

/// Directory holding one log database per group
const GROUPS_DIR: &str = "groups";

/// Persistent record of group membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub discovery_key: DiscoveryKey,
    pub title: Option<String>,
    /// Unix timestamp of the first create or join
    pub created_at: i64,
    /// Whether the log is kept on disk; otherwise it lives in memory and is
    /// re-replicated from peers on every start
    pub persistent: bool,
    /// Tombstone: the group was left
    pub deleted: bool,
    /// Peers from the join link
    pub bootstrap_peers: Vec<NodeAddrBytes>,
}

impl GroupRecord {
    pub fn new(
        discovery_key: DiscoveryKey,
        title: impl Into<String>,
        persistent: bool,
        bootstrap_peers: Vec<NodeAddrBytes>,
    ) -> Self {
        let title = title.into();
        Self {
            discovery_key,
            title: (!title.is_empty()).then_some(title),
            created_at: chrono::Utc::now().timestamp(),
            persistent,
            deleted: false,
            bootstrap_peers,
        }
    }

    /// Title for display, falling back to the discovery key
    pub fn display_title(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| self.discovery_key.to_string())
    }
}

/// Create, join, leave and open groups
pub struct GroupRegistry {
    storage: NodeStorage,
    groups_dir: PathBuf,
    config: SwarmConfig,
    open: RwLock<HashMap<DiscoveryKey, Arc<Group>>>,
}

impl GroupRegistry {
    /// Open the registry rooted at `data_dir`
    pub fn open(data_dir: impl AsRef<Path>, config: SwarmConfig) -> SyncResult<Self> {
        let data_dir = data_dir.as_ref();
        let storage = NodeStorage::new(data_dir.join(NODE_DB_FILE))?;
        Ok(Self::new(storage, data_dir.join(GROUPS_DIR), config))
    }

    pub fn new(storage: NodeStorage, groups_dir: PathBuf, config: SwarmConfig) -> Self {
        Self {
            storage,
            groups_dir,
            config,
            open: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &NodeStorage {
        &self.storage
    }

    fn log_path(&self, dk: &DiscoveryKey) -> PathBuf {
        self.groups_dir.join(format!("{}.redb", dk.to_base58()))
    }

    /// Start a new group with fresh keys
    pub fn create(&self, title: &str, persistent: bool) -> SyncResult<Arc<Group>> {
        let keys = GroupKeys::generate();
        let record = GroupRecord::new(keys.discovery_key(), title, persistent, Vec::new());
        info!(dk = %record.discovery_key, title, "Creating group");
        self.admit(record, keys)
    }

    /// Join the group described by `link`.
    ///
    /// Joining a group that is already active returns it unchanged. A
    /// tombstoned group is revived, keeping its title and creation time.
    pub fn join(&self, link: &JoinLink, persistent: bool) -> SyncResult<Arc<Group>> {
        let keys = link.keys();
        let dk = keys.discovery_key();

        let record = match self.storage.load_group(&dk)? {
            Some(record) if !record.deleted => {
                debug!(dk = %dk, "Already a member");
                return self.group(&dk);
            }
            Some(mut tombstone) => {
                info!(dk = %dk, "Reviving group from tombstone");
                tombstone.deleted = false;
                tombstone.persistent = persistent;
                if tombstone.title.is_none() {
                    tombstone.title = link.title.clone();
                }
                tombstone.bootstrap_peers = link.bootstrap_peers.clone();
                tombstone
            }
            None => {
                info!(dk = %dk, "Joining group");
                GroupRecord::new(
                    dk,
                    link.title.clone().unwrap_or_default(),
                    persistent,
                    link.bootstrap_peers.clone(),
                )
            }
        };
        self.admit(record, keys)
    }

    /// Persist the group keys and the record, then open it with a fresh writer.
    ///
    /// Only persistent groups keep their writer key: an empty in-memory log
    /// must never be paired with a key that already signed entries.
    fn admit(&self, record: GroupRecord, keys: GroupKeys) -> SyncResult<Arc<Group>> {
        let dk = record.discovery_key;
        let writer = Keypair::generate();
        self.storage.save_group_keys(&dk, &keys.to_material())?;
        if record.persistent {
            self.storage.save_writer_key(&dk, &writer.secret_bytes())?;
        } else {
            self.storage.delete_writer_key(&dk)?;
        }
        self.storage.save_group(&record)?;

        let group = Arc::new(self.build(&record, keys, writer)?);
        self.open.write().insert(dk, group.clone());
        Ok(group)
    }

    fn build(&self, record: &GroupRecord, keys: GroupKeys, writer: Keypair) -> SyncResult<Group> {
        let keys = Arc::new(keys);
        let capacity = self.config.update_channel_capacity;
        let store = if record.persistent {
            LogStore::open(self.log_path(&record.discovery_key), keys, capacity)?
        } else {
            LogStore::in_memory(keys, capacity)?
        };
        Ok(Group::new(writer, Arc::new(store)).with_bootstrap(record.bootstrap_peers.clone()))
    }

    /// The open group for `dk`, opening it from storage if needed.
    ///
    /// Returns `GroupNotFound` for unknown or left groups.
    pub fn group(&self, dk: &DiscoveryKey) -> SyncResult<Arc<Group>> {
        if let Some(group) = self.open.read().get(dk) {
            return Ok(group.clone());
        }

        let record = self
            .storage
            .load_group(dk)?
            .filter(|r| !r.deleted)
            .ok_or_else(|| SyncError::GroupNotFound(dk.to_string()))?;
        let keys: GroupKeys = self
            .storage
            .load_group_keys(dk)?
            .ok_or_else(|| SyncError::Storage(format!("Missing keys for group {}", dk)))?
            .into();
        let writer = if record.persistent {
            self.storage
                .load_writer_key(dk)?
                .map(|secret| Keypair::from_secret_bytes(&secret))
                .ok_or_else(|| SyncError::Storage(format!("Missing writer key for group {}", dk)))?
        } else {
            debug!(dk = %dk, "Ephemeral group, writing under a new key");
            Keypair::generate()
        };

        let mut open = self.open.write();
        // another caller may have opened it meanwhile; keep theirs
        if let Some(group) = open.get(dk) {
            return Ok(group.clone());
        }
        let group = Arc::new(self.build(&record, keys, writer)?);
        open.insert(*dk, group.clone());
        Ok(group)
    }

    /// Open every active group
    pub fn open_all(&self) -> SyncResult<Vec<Arc<Group>>> {
        self.list()?
            .iter()
            .map(|record| self.group(&record.discovery_key))
            .collect()
    }

    /// Leave a group: delete its log and secrets, keep a tombstone.
    ///
    /// Returns `false` if the group is unknown or already left. Stop
    /// replicating it first so no session still holds the store.
    pub fn leave(&self, dk: &DiscoveryKey) -> SyncResult<bool> {
        let Some(mut record) = self.storage.load_group(dk)? else {
            return Ok(false);
        };
        if record.deleted {
            return Ok(false);
        }

        self.open.write().remove(dk);
        self.storage.delete_group_secrets(dk)?;

        let path = self.log_path(dk);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dk = %dk, error = %e, "Failed to delete group log"),
        }

        record.deleted = true;
        record.bootstrap_peers.clear();
        self.storage.save_group(&record)?;
        info!(dk = %dk, "Left group");
        Ok(true)
    }

    /// Active groups, oldest first
    pub fn list(&self) -> SyncResult<Vec<GroupRecord>> {
        let mut records: Vec<_> = self
            .storage
            .list_groups()?
            .into_iter()
            .filter(|r| !r.deleted)
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Every record, tombstones included
    pub fn list_all(&self) -> SyncResult<Vec<GroupRecord>> {
        self.storage.list_groups()
    }

    pub fn record(&self, dk: &DiscoveryKey) -> SyncResult<Option<GroupRecord>> {
        self.storage.load_group(dk)
    }

    /// Find an active group by title or by a prefix of its base58 discovery key
    pub fn resolve(&self, query: &str) -> SyncResult<DiscoveryKey> {
        let records = self.list()?;
        if let Some(record) = records.iter().find(|r| r.title.as_deref() == Some(query)) {
            return Ok(record.discovery_key);
        }

        let matches: Vec<_> = records
            .iter()
            .filter(|r| !query.is_empty() && r.discovery_key.to_base58().starts_with(query))
            .collect();
        match matches.as_slice() {
            [record] => Ok(record.discovery_key),
            [] => Err(SyncError::GroupNotFound(query.to_string())),
            _ => Err(SyncError::GroupNotFound(format!(
                "'{}' matches {} groups",
                query,
                matches.len()
            ))),
        }
    }

    /// Append to this node's log in the group
    pub fn append(&self, dk: &DiscoveryKey, body: &EntryBody) -> SyncResult<LogEntry> {
        self.group(dk)?.append(body)
    }

    /// A join link for an active group
    pub fn invite(&self, dk: &DiscoveryKey, bootstrap: Vec<NodeAddrBytes>) -> SyncResult<JoinLink> {
        let record = self
            .record(dk)?
            .filter(|r| !r.deleted)
            .ok_or_else(|| SyncError::GroupNotFound(dk.to_string()))?;
        let group = self.group(dk)?;
        Ok(JoinLink::new(
            group.keys(),
            record.title.unwrap_or_default(),
            bootstrap,
        ))
    }
}
