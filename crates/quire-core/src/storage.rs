//! Node-level persistent storage using redb
//!
//! Holds everything about this node that is not a log entry:
//! - Group records (title, join time, tombstones)
//! - Group key material
//! - This node's writer key pair per group
//! - The iroh endpoint secret key
//!
//! Log entries live in one database file per group, see [`crate::log::LogStore`].

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{SyncError, SyncResult};
use crate::group::{GroupKeyMaterial, GroupRecord};
use crate::types::DiscoveryKey;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

const GROUPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");
const GROUP_KEYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("group_keys");
const WRITER_KEYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("writer_keys");
const ENDPOINT_SECRET_KEY_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("endpoint_secret_key");

fn to_key32(bytes: &[u8], what: &str) -> SyncResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| SyncError::Storage(format!("Stored {} has length {}", what, bytes.len())))
}

/// Storage for node state, shared between the registry and the node
#[derive(Clone)]
pub struct NodeStorage {
    db: Arc<RwLock<Database>>,
}

impl NodeStorage {
    /// Open or create the node database at `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(GROUPS_TABLE)?;
            let _ = write_txn.open_table(GROUP_KEYS_TABLE)?;
            let _ = write_txn.open_table(WRITER_KEYS_TABLE)?;
            let _ = write_txn.open_table(ENDPOINT_SECRET_KEY_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn put(&self, table: Table, key: &str, value: &[u8]) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn fetch(&self, table: Table, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Group Records
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a group record, overwriting any previous one.
    pub fn save_group(&self, record: &GroupRecord) -> SyncResult<()> {
        let data =
            serde_json::to_vec(record).map_err(|e| SyncError::Serialization(e.to_string()))?;
        self.put(GROUPS_TABLE, &record.discovery_key.to_base58(), &data)
    }

    pub fn load_group(&self, dk: &DiscoveryKey) -> SyncResult<Option<GroupRecord>> {
        self.fetch(GROUPS_TABLE, &dk.to_base58())?
            .map(|data| {
                serde_json::from_slice(&data).map_err(|e| SyncError::Serialization(e.to_string()))
            })
            .transpose()
    }

    /// All group records, tombstones included
    pub fn list_groups(&self) -> SyncResult<Vec<GroupRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(GROUPS_TABLE)?;

        let mut groups = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: GroupRecord = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            groups.push(record);
        }
        Ok(groups)
    }

    /// Remove a group's secrets: key material and writer key.
    ///
    /// The group record itself is kept, so it can serve as a tombstone.
    pub fn delete_group_secrets(&self, dk: &DiscoveryKey) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let key = dk.to_base58();
            let mut keys = write_txn.open_table(GROUP_KEYS_TABLE)?;
            let mut writers = write_txn.open_table(WRITER_KEYS_TABLE)?;
            keys.remove(key.as_str())?;
            writers.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Group Keys
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_group_keys(&self, dk: &DiscoveryKey, material: &GroupKeyMaterial) -> SyncResult<()> {
        let data = postcard::to_allocvec(material)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        self.put(GROUP_KEYS_TABLE, &dk.to_base58(), &data)
    }

    pub fn load_group_keys(&self, dk: &DiscoveryKey) -> SyncResult<Option<GroupKeyMaterial>> {
        self.fetch(GROUP_KEYS_TABLE, &dk.to_base58())?
            .map(|data| {
                postcard::from_bytes(&data).map_err(|e| SyncError::Serialization(e.to_string()))
            })
            .transpose()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writer Keys
    // ═══════════════════════════════════════════════════════════════════════

    /// Save this node's writer secret key for a group
    pub fn save_writer_key(&self, dk: &DiscoveryKey, secret: &[u8; 32]) -> SyncResult<()> {
        self.put(WRITER_KEYS_TABLE, &dk.to_base58(), secret.as_slice())
    }

    pub fn load_writer_key(&self, dk: &DiscoveryKey) -> SyncResult<Option<[u8; 32]>> {
        self.fetch(WRITER_KEYS_TABLE, &dk.to_base58())?
            .map(|data| to_key32(&data, "writer key"))
            .transpose()
    }

    pub fn delete_writer_key(&self, dk: &DiscoveryKey) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut writers = write_txn.open_table(WRITER_KEYS_TABLE)?;
            writers.remove(dk.to_base58().as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Endpoint Secret Key
    // ═══════════════════════════════════════════════════════════════════════

    /// There is only one endpoint per node
    const ENDPOINT_SECRET_KEY: &'static str = "endpoint_secret_key";

    pub fn save_endpoint_secret_key(&self, secret_key: &[u8; 32]) -> SyncResult<()> {
        self.put(
            ENDPOINT_SECRET_KEY_TABLE,
            Self::ENDPOINT_SECRET_KEY,
            secret_key.as_slice(),
        )
    }

    pub fn load_endpoint_secret_key(&self) -> SyncResult<Option<[u8; 32]>> {
        self.fetch(ENDPOINT_SECRET_KEY_TABLE, Self::ENDPOINT_SECRET_KEY)?
            .map(|data| to_key32(&data, "endpoint secret key"))
            .transpose()
    }
}
