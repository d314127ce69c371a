//! Runtime configuration
//!
//! Defaults suit a desktop node. A `config.json` in the data directory may
//! override any field; missing fields keep their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// File name looked up inside the data directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Tunables for replication and the swarm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Concurrent sessions allowed per group
    pub max_peers_per_group: usize,
    /// A session awaiting progress for this long is failed
    pub idle_timeout_ms: u64,
    /// Bound on transport hint resolution before falling back to defaults
    pub hint_timeout_ms: u64,
    /// Invalid or conflicting entries tolerated per session before it is dropped
    pub max_invalid_entries: u32,
    /// Largest accepted frame in bytes
    pub max_message_size: usize,
    /// Change-notification buffer per group
    pub update_channel_capacity: usize,
    /// Pending discovered connections per group
    pub connection_queue: usize,
    /// `SyncEvent` broadcast buffer
    pub event_channel_capacity: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_peers_per_group: 3,
            idle_timeout_ms: 30_000,
            hint_timeout_ms: 6_000,
            max_invalid_entries: 8,
            max_message_size: 1024 * 1024,
            update_channel_capacity: 256,
            connection_queue: 16,
            event_channel_capacity: 256,
        }
    }
}

impl SwarmConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn hint_timeout(&self) -> Duration {
        Duration::from_millis(self.hint_timeout_ms)
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `config.json` from `data_dir`, or defaults if absent
    pub fn load_or_default(data_dir: impl AsRef<Path>) -> SyncResult<Self> {
        let path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Reject values that would disable replication outright
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_peers_per_group == 0 {
            return Err(SyncError::Config(
                "max_peers_per_group must be at least 1".to_string(),
            ));
        }
        if self.max_message_size < 1024 {
            return Err(SyncError::Config(
                "max_message_size must be at least 1024 bytes".to_string(),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(SyncError::Config("idle_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}
