//! Log entries and their plaintext bodies

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};
use crate::sync::envelope::Envelope;
use crate::types::{ContentDigest, LogPosition, WriterKey};

/// Plaintext body of a log entry.
///
/// Bodies are JSON objects. Their canonical serialization sorts object keys
/// recursively, so the same logical body always hashes to the same
/// [`ContentDigest`] regardless of insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryBody(Value);

impl EntryBody {
    /// Wrap a JSON value; only objects are accepted.
    pub fn new(value: Value) -> SyncResult<Self> {
        if !value.is_object() {
            return Err(SyncError::Validation(
                "entry body must be a JSON object".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Parse a body from JSON text
    pub fn from_json_str(s: &str) -> SyncResult<Self> {
        let value: Value = serde_json::from_str(s)
            .map_err(|e| SyncError::Validation(format!("entry body is not JSON: {}", e)))?;
        Self::new(value)
    }

    /// Parse a body from its canonical bytes
    pub fn from_canonical_bytes(bytes: &[u8]) -> SyncResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| SyncError::Validation(format!("entry body is not JSON: {}", e)))?;
        Self::new(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Deterministic serialization with sorted object keys
    pub fn canonical_bytes(&self) -> SyncResult<Vec<u8>> {
        serde_json::to_vec(&canonicalize(&self.0))
            .map_err(|e| SyncError::Serialization(format!("Failed to encode body: {}", e)))
    }

    /// Content address of this body
    pub fn digest(&self) -> SyncResult<ContentDigest> {
        Ok(digest_of(&self.canonical_bytes()?))
    }
}

/// Hash canonical body bytes into a content digest
pub fn digest_of(canonical: &[u8]) -> ContentDigest {
    ContentDigest(*blake3::hash(canonical).as_bytes())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// A decoded, verified entry together with its wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub writer: WriterKey,
    pub index: u64,
    pub body: EntryBody,
    pub digest: ContentDigest,
    pub envelope: Envelope,
}

impl LogEntry {
    pub fn position(&self) -> LogPosition {
        LogPosition {
            writer: self.writer,
            index: self.index,
        }
    }
}

/// Where a stored entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Appended by this node
    Local,
    /// Delivered by a peer
    Remote,
}

/// Change notification published after every successful store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogUpdate {
    pub writer: WriterKey,
    pub index: u64,
    pub origin: Origin,
}
