//! Error types for Quire

use thiserror::Error;

/// Main error type for Quire operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// A received entry failed signature, decryption, or schema checks
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A different entry already occupies this log position, or a local
    /// append lost a race for it
    #[error("Conflict at {writer}#{index}")]
    Conflict { writer: String, index: u64 },

    /// A remote entry does not extend the writer's log by exactly one
    #[error("Out of order entry {writer}#{index} (expected index {expected})")]
    OutOfOrder {
        writer: String,
        index: u64,
        expected: u64,
    },

    /// Peer failed to prove knowledge of the replication key
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Connection-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer sent a message that is not valid in the current session state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No progress within the configured interval
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Requested entry is not stored locally
    #[error("Not found: {0}")]
    NotFound(String),

    /// Group was not found in the registry
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Error during gossip protocol operations
    #[error("Gossip error: {0}")]
    Gossip(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid join link format or data
    #[error("Invalid invite: {0}")]
    InvalidInvite(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Build a `Conflict` for a writer position.
    pub fn conflict(writer: impl std::fmt::Display, index: u64) -> Self {
        Self::Conflict {
            writer: writer.to_string(),
            index,
        }
    }

    /// Whether this error ends a replication session.
    ///
    /// Validation and conflict failures are attributed to a single entry and
    /// are counted instead; everything connection-level is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::Handshake(_)
                | SyncError::Transport(_)
                | SyncError::Protocol(_)
                | SyncError::Timeout(_)
                | SyncError::Io(_)
        )
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::GroupNotFound("test-group".to_string());
        assert_eq!(format!("{}", err), "Group not found: test-group");

        let err = SyncError::conflict("abcd", 3);
        assert_eq!(format!("{}", err), "Conflict at abcd#3");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
        assert!(sync_err.is_terminal());
    }

    #[test]
    fn test_entry_level_errors_are_not_terminal() {
        assert!(!SyncError::Validation("bad signature".into()).is_terminal());
        assert!(!SyncError::conflict("abcd", 0).is_terminal());
        assert!(SyncError::Handshake("bad proof".into()).is_terminal());
    }
}
