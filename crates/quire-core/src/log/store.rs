//! Append-only, per-writer log storage using redb
//!
//! One `LogStore` holds every writer's log for a single group. Entries are
//! addressed by `(writer, index)` and, through a secondary index, by content
//! digest.
//!
//! ## Tables
//!
//! ```text
//! entries       (writer, index) -> postcard(StoredEntry)
//! entry_counts  writer          -> number of entries (head = count - 1)
//! digests       digest          -> (writer, index), first writer wins
//! ```
//!
//! ## Gap-free invariant
//!
//! An entry is only inserted when its index equals the writer's current
//! count, checked inside the same write transaction that bumps the count.
//! Local appends and remote puts for the same writer are additionally
//! serialized by a per-writer lock, so `head(w) = H` always implies
//! entries `0..=H` exist.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::group::keys::GroupKeys;
use crate::identity::Keypair;
use crate::log::entry::{EntryBody, LogEntry, LogUpdate, Origin};
use crate::sync::envelope::Envelope;
use crate::types::{ContentDigest, WriterKey};

const ENTRIES_TABLE: TableDefinition<(&[u8], u64), &[u8]> = TableDefinition::new("entries");
const COUNTS_TABLE: TableDefinition<&[u8], u64> = TableDefinition::new("entry_counts");
const DIGESTS_TABLE: TableDefinition<&[u8], (&[u8], u64)> = TableDefinition::new("digests");

/// On-disk form of an entry: the envelope plus its verified plaintext
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    envelope: Envelope,
    body: Vec<u8>,
    digest: ContentDigest,
}

impl StoredEntry {
    fn into_entry(self) -> SyncResult<LogEntry> {
        Ok(LogEntry {
            writer: self.envelope.writer,
            index: self.envelope.index,
            body: EntryBody::from_canonical_bytes(&self.body)?,
            digest: self.digest,
            envelope: self.envelope,
        })
    }
}

/// Result of delivering a remote envelope
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// The entry extended the writer's log
    Stored(LogEntry),
    /// The identical entry was already present; nothing changed
    AlreadyPresent(LogEntry),
}

impl PutOutcome {
    pub fn entry(&self) -> &LogEntry {
        match self {
            PutOutcome::Stored(e) | PutOutcome::AlreadyPresent(e) => e,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, PutOutcome::Stored(_))
    }
}

/// Multi-writer log store for one group
pub struct LogStore {
    keys: Arc<GroupKeys>,
    db: Database,
    writer_locks: Mutex<HashMap<WriterKey, Arc<Mutex<()>>>>,
    updates: broadcast::Sender<LogUpdate>,
}

impl LogStore {
    /// Open or create the store at `path`.
    ///
    /// `update_capacity` bounds the change-notification buffer; subscribers
    /// that fall further behind observe `Lagged`.
    pub fn open(
        path: impl AsRef<Path>,
        keys: Arc<GroupKeys>,
        update_capacity: usize,
    ) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        Self::init(db, keys, update_capacity)
    }

    /// Create a store backed by memory only
    pub fn in_memory(keys: Arc<GroupKeys>, update_capacity: usize) -> SyncResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db, keys, update_capacity)
    }

    fn init(db: Database, keys: Arc<GroupKeys>, update_capacity: usize) -> SyncResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENTRIES_TABLE)?;
            let _ = write_txn.open_table(COUNTS_TABLE)?;
            let _ = write_txn.open_table(DIGESTS_TABLE)?;
        }
        write_txn.commit()?;

        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Ok(Self {
            keys,
            db,
            writer_locks: Mutex::new(HashMap::new()),
            updates,
        })
    }

    pub fn keys(&self) -> &Arc<GroupKeys> {
        &self.keys
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Highest stored index for `writer`, or `None` if its log is empty.
    pub fn head(&self, writer: &WriterKey) -> SyncResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let counts = read_txn.open_table(COUNTS_TABLE)?;
        Ok(read_count(&counts, writer)?.checked_sub(1))
    }

    /// Entry at `(writer, index)`, or `None` if not stored.
    pub fn get(&self, writer: &WriterKey, index: u64) -> SyncResult<Option<LogEntry>> {
        self.load(writer, index)?
            .map(StoredEntry::into_entry)
            .transpose()
    }

    /// Wire form of the entry at `(writer, index)`
    pub fn get_envelope(&self, writer: &WriterKey, index: u64) -> SyncResult<Option<Envelope>> {
        Ok(self.load(writer, index)?.map(|stored| stored.envelope))
    }

    /// Entry whose body hashes to `digest`.
    ///
    /// If several entries share a body, the first one stored is returned.
    pub fn get_by_digest(&self, digest: &ContentDigest) -> SyncResult<Option<LogEntry>> {
        let location = {
            let read_txn = self.db.begin_read()?;
            let digests = read_txn.open_table(DIGESTS_TABLE)?;
            let found = digests.get(digest.as_bytes().as_slice())?;
            found.map(|guard| {
                let (writer, index) = guard.value();
                (writer.to_vec(), index)
            })
        };

        let Some((writer, index)) = location else {
            return Ok(None);
        };
        let writer: [u8; 32] = writer
            .try_into()
            .map_err(|_| SyncError::Storage("corrupt digest index entry".to_string()))?;
        self.get(&WriterKey(writer), index)
    }

    /// Every writer with at least one stored entry
    pub fn list_writers(&self) -> SyncResult<BTreeSet<WriterKey>> {
        Ok(self.heads()?.into_iter().map(|(writer, _)| writer).collect())
    }

    /// Current head of every non-empty log
    pub fn heads(&self) -> SyncResult<Vec<(WriterKey, u64)>> {
        let read_txn = self.db.begin_read()?;
        let counts = read_txn.open_table(COUNTS_TABLE)?;

        let mut heads = Vec::new();
        for item in counts.iter()? {
            let (key, count) = item?;
            let Some(head) = count.value().checked_sub(1) else {
                continue;
            };
            let writer: [u8; 32] = key
                .value()
                .try_into()
                .map_err(|_| SyncError::Storage("corrupt writer key".to_string()))?;
            heads.push((WriterKey(writer), head));
        }
        Ok(heads)
    }

    /// All entries of `writer` in index order
    pub fn entries(&self, writer: &WriterKey) -> SyncResult<Vec<LogEntry>> {
        let Some(head) = self.head(writer)? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::with_capacity(head as usize + 1);
        for index in 0..=head {
            let entry = self.get(writer, index)?.ok_or_else(|| {
                SyncError::Storage(format!("gap in log {} at index {}", writer, index))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Total number of entries across all writers
    pub fn len(&self) -> SyncResult<u64> {
        let read_txn = self.db.begin_read()?;
        let entries = read_txn.open_table(ENTRIES_TABLE)?;
        Ok(entries.len()?)
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    fn load(&self, writer: &WriterKey, index: u64) -> SyncResult<Option<StoredEntry>> {
        let read_txn = self.db.begin_read()?;
        let entries = read_txn.open_table(ENTRIES_TABLE)?;
        let result = match entries.get((writer.as_bytes().as_slice(), index))? {
            Some(v) => Some(
                postcard::from_bytes::<StoredEntry>(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        Ok(result)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a new entry to `writer`'s own log.
    ///
    /// The index is `head + 1`. Fails with `SyncError::Conflict` if another
    /// write for the same writer took that index first.
    pub fn append(&self, writer: &Keypair, body: &EntryBody) -> SyncResult<LogEntry> {
        let writer_key = writer.writer_key();
        let lock = self.writer_lock(writer_key);
        let _guard = lock.lock();

        let index = self.head(&writer_key)?.map_or(0, |h| h + 1);
        let envelope = Envelope::encode(body, index, writer, &self.keys)?;
        let entry = LogEntry {
            writer: writer_key,
            index,
            body: body.clone(),
            digest: body.digest()?,
            envelope,
        };

        self.insert(&entry)?;
        debug!(writer = %writer_key, index, "Appended local entry");
        self.notify(&entry, Origin::Local);
        Ok(entry)
    }

    /// Store an entry delivered by a peer.
    ///
    /// The envelope is verified first and never stored if invalid. Delivering
    /// an entry that is already stored is a no-op. A *different* entry at an
    /// occupied position fails with `SyncError::Conflict`, and an index other
    /// than `head + 1` fails with `SyncError::OutOfOrder`.
    pub fn put(&self, envelope: Envelope) -> SyncResult<PutOutcome> {
        let entry = envelope.decode(&self.keys)?;

        let lock = self.writer_lock(entry.writer);
        let _guard = lock.lock();

        if let Some(existing) = self.load(&entry.writer, entry.index)? {
            if existing.envelope == entry.envelope {
                return Ok(PutOutcome::AlreadyPresent(existing.into_entry()?));
            }
            warn!(
                position = %entry.position(),
                "Rejecting conflicting entry; stored entry kept"
            );
            return Err(SyncError::conflict(entry.writer, entry.index));
        }

        let expected = self.head(&entry.writer)?.map_or(0, |h| h + 1);
        if entry.index != expected {
            return Err(SyncError::OutOfOrder {
                writer: entry.writer.to_string(),
                index: entry.index,
                expected,
            });
        }

        self.insert(&entry)?;
        debug!(position = %entry.position(), "Stored remote entry");
        self.notify(&entry, Origin::Remote);
        Ok(PutOutcome::Stored(entry))
    }

    /// Insert `entry` if its index still equals the writer's count.
    fn insert(&self, entry: &LogEntry) -> SyncResult<()> {
        let stored = StoredEntry {
            envelope: entry.envelope.clone(),
            body: entry.body.canonical_bytes()?,
            digest: entry.digest,
        };
        let data = postcard::to_allocvec(&stored)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        let writer = entry.writer.as_bytes().as_slice();

        let write_txn = self.db.begin_write()?;
        let raced = {
            let mut counts = write_txn.open_table(COUNTS_TABLE)?;
            let count = read_count(&counts, &entry.writer)?;
            if count != entry.index {
                true
            } else {
                let mut entries = write_txn.open_table(ENTRIES_TABLE)?;
                entries.insert((writer, entry.index), data.as_slice())?;
                counts.insert(writer, count + 1)?;

                let mut digests = write_txn.open_table(DIGESTS_TABLE)?;
                let digest = entry.digest.as_bytes().as_slice();
                if digests.get(digest)?.is_none() {
                    digests.insert(digest, (writer, entry.index))?;
                }
                false
            }
        };

        if raced {
            write_txn.abort()?;
            return Err(SyncError::conflict(entry.writer, entry.index));
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Notifications
    // ═══════════════════════════════════════════════════════════════════════

    /// Subscribe to change notifications.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<LogUpdate> {
        self.updates.subscribe()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }

    fn notify(&self, entry: &LogEntry, origin: Origin) {
        // No receivers is not an error
        let _ = self.updates.send(LogUpdate {
            writer: entry.writer,
            index: entry.index,
            origin,
        });
    }

    fn writer_lock(&self, writer: WriterKey) -> Arc<Mutex<()>> {
        self.writer_locks
            .lock()
            .entry(writer)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("discovery_key", &self.keys.discovery_key())
            .finish_non_exhaustive()
    }
}

fn read_count<T>(counts: &T, writer: &WriterKey) -> SyncResult<u64>
where
    T: ReadableTable<&'static [u8], u64>,
{
    Ok(counts
        .get(writer.as_bytes().as_slice())?
        .map(|guard| guard.value())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> LogStore {
        LogStore::in_memory(Arc::new(GroupKeys::generate()), 64).expect("Should open store")
    }

    fn body(n: u64) -> EntryBody {
        EntryBody::new(json!({"type": "note", "n": n})).unwrap()
    }

    #[test]
    fn test_empty_store() {
        let store = store();
        let writer = Keypair::generate().writer_key();

        assert_eq!(store.head(&writer).unwrap(), None);
        assert!(store.get(&writer, 0).unwrap().is_none());
        assert!(store.list_writers().unwrap().is_empty());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_append_assigns_dense_indices() {
        let store = store();
        let writer = Keypair::generate();

        for n in 0..3 {
            let entry = store.append(&writer, &body(n)).expect("Should append");
            assert_eq!(entry.index, n);
        }

        assert_eq!(store.head(&writer.writer_key()).unwrap(), Some(2));
        let entries = store.entries(&writer.writer_key()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].body, body(1));
    }

    #[test]
    fn test_writers_are_independent() {
        let store = store();
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        store.append(&alice, &body(0)).unwrap();
        store.append(&alice, &body(1)).unwrap();
        let first_bob = store.append(&bob, &body(0)).unwrap();

        assert_eq!(first_bob.index, 0);
        assert_eq!(store.head(&alice.writer_key()).unwrap(), Some(1));
        assert_eq!(store.head(&bob.writer_key()).unwrap(), Some(0));

        let writers = store.list_writers().unwrap();
        assert_eq!(writers.len(), 2);
        assert!(writers.contains(&alice.writer_key()));
    }

    #[test]
    fn test_get_by_digest() {
        let store = store();
        let writer = Keypair::generate();

        let entry = store.append(&writer, &body(7)).unwrap();
        let found = store.get_by_digest(&entry.digest).unwrap().unwrap();
        assert_eq!(found.position(), entry.position());

        assert!(store
            .get_by_digest(&ContentDigest([0; 32]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_digest_index_keeps_first_entry() {
        let store = store();
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let first = store.append(&alice, &body(1)).unwrap();
        let second = store.append(&bob, &body(1)).unwrap();
        assert_eq!(first.digest, second.digest);

        let found = store.get_by_digest(&first.digest).unwrap().unwrap();
        assert_eq!(found.writer, alice.writer_key());
    }

    #[test]
    fn test_put_extends_log() {
        let source = store();
        let target = LogStore::in_memory(source.keys().clone(), 64).unwrap();
        let writer = Keypair::generate();

        let entry = source.append(&writer, &body(0)).unwrap();
        let outcome = target.put(entry.envelope.clone()).unwrap();

        assert!(outcome.is_stored());
        assert_eq!(target.head(&writer.writer_key()).unwrap(), Some(0));
        assert_eq!(target.get(&writer.writer_key(), 0).unwrap().unwrap().body, body(0));
    }

    #[test]
    fn test_put_is_idempotent() {
        let source = store();
        let target = LogStore::in_memory(source.keys().clone(), 64).unwrap();
        let writer = Keypair::generate();
        let entry = source.append(&writer, &body(0)).unwrap();

        target.put(entry.envelope.clone()).unwrap();
        let again = target.put(entry.envelope.clone()).unwrap();

        assert!(matches!(again, PutOutcome::AlreadyPresent(_)));
        assert_eq!(target.len().unwrap(), 1);
    }

    #[test]
    fn test_put_rejects_conflicting_entry() {
        let keys = Arc::new(GroupKeys::generate());
        let target = LogStore::in_memory(keys.clone(), 64).unwrap();
        let writer = Keypair::generate();

        let a = Envelope::encode(&body(1), 0, &writer, &keys).unwrap();
        let b = Envelope::encode(&body(2), 0, &writer, &keys).unwrap();

        target.put(a).unwrap();
        let err = target.put(b).unwrap_err();

        assert!(matches!(err, SyncError::Conflict { index: 0, .. }));
        assert_eq!(target.get(&writer.writer_key(), 0).unwrap().unwrap().body, body(1));
    }

    #[test]
    fn test_put_rejects_gap() {
        let keys = Arc::new(GroupKeys::generate());
        let target = LogStore::in_memory(keys.clone(), 64).unwrap();
        let writer = Keypair::generate();

        let second = Envelope::encode(&body(1), 1, &writer, &keys).unwrap();
        let err = target.put(second).unwrap_err();

        assert!(matches!(
            err,
            SyncError::OutOfOrder {
                index: 1,
                expected: 0,
                ..
            }
        ));
        assert_eq!(target.head(&writer.writer_key()).unwrap(), None);
    }

    #[test]
    fn test_put_rejects_invalid_envelope() {
        let keys = Arc::new(GroupKeys::generate());
        let target = LogStore::in_memory(keys.clone(), 64).unwrap();
        let writer = Keypair::generate();

        let mut envelope = Envelope::encode(&body(0), 0, &writer, &keys).unwrap();
        envelope.signature[5] ^= 0x01;

        assert!(matches!(target.put(envelope), Err(SyncError::Validation(_))));
        assert!(target.is_empty().unwrap());
    }

    #[test]
    fn test_append_after_remote_put_continues_sequence() {
        let keys = Arc::new(GroupKeys::generate());
        let target = LogStore::in_memory(keys.clone(), 64).unwrap();
        let writer = Keypair::generate();

        // Same writer key used on another device
        target
            .put(Envelope::encode(&body(0), 0, &writer, &keys).unwrap())
            .unwrap();
        let next = target.append(&writer, &body(1)).unwrap();
        assert_eq!(next.index, 1);
    }

    #[test]
    fn test_subscribers_are_notified() {
        let store = store();
        let writer = Keypair::generate();
        let mut updates = store.subscribe();
        assert_eq!(store.subscriber_count(), 1);

        store.append(&writer, &body(0)).unwrap();
        let update = updates.try_recv().unwrap();
        assert_eq!(update.writer, writer.writer_key());
        assert_eq!(update.index, 0);
        assert_eq!(update.origin, Origin::Local);

        drop(updates);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_duplicate_put_does_not_notify() {
        let source = store();
        let target = LogStore::in_memory(source.keys().clone(), 64).unwrap();
        let writer = Keypair::generate();
        let entry = source.append(&writer, &body(0)).unwrap();

        target.put(entry.envelope.clone()).unwrap();
        let mut updates = target.subscribe();
        target.put(entry.envelope).unwrap();

        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.redb");
        let keys = Arc::new(GroupKeys::generate());
        let writer = Keypair::generate();

        {
            let store = LogStore::open(&path, keys.clone(), 16).unwrap();
            store.append(&writer, &body(0)).unwrap();
            store.append(&writer, &body(1)).unwrap();
        }

        let store = LogStore::open(&path, keys, 16).unwrap();
        assert_eq!(store.head(&writer.writer_key()).unwrap(), Some(1));
        assert_eq!(store.append(&writer, &body(2)).unwrap().index, 2);
    }

    #[test]
    fn test_concurrent_appends_stay_gap_free() {
        let store = Arc::new(store());
        let writer = Keypair::generate();

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                let writer = writer.clone();
                std::thread::spawn(move || store.append(&writer, &body(n)).unwrap().index)
            })
            .collect();

        let mut indices: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indices.sort();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
        assert_eq!(store.head(&writer.writer_key()).unwrap(), Some(7));
    }
}
