//! Quire Core Library
//!
//! Multi-writer, append-only logs replicated peer to peer.
//!
//! ## Overview
//!
//! A *group* is a set of nodes sharing one secret. Every member writes to its
//! own log; each entry is a JSON object that is encrypted for the group,
//! signed by its writer and countersigned with the group key. Members find
//! each other through a discovery key derived from the group secret and
//! exchange whatever entries the other side is missing.
//!
//! ## Core Principles
//!
//! - **Local-first**: appends never wait for the network
//! - **Gap-free logs**: a writer's log holds indices `0..=head` and nothing else
//! - **Verify before store**: nothing from a peer is stored until its
//!   signatures check out and its body decrypts
//!
//! ## Quick Start
//!
//! ```
//! use quire_core::group::{Group, GroupKeys};
//! use quire_core::identity::Keypair;
//! use quire_core::log::EntryBody;
//! use serde_json::json;
//!
//! let group = Group::in_memory(GroupKeys::generate(), Keypair::generate(), 16).unwrap();
//! let body = EntryBody::new(json!({ "text": "first" })).unwrap();
//!
//! let entry = group.append(&body).unwrap();
//! assert_eq!(entry.index, 0);
//! assert_eq!(group.store().head(&group.writer_key()).unwrap(), Some(0));
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod group;
pub mod identity;
pub mod invite;
pub mod log;
pub mod node;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use config::SwarmConfig;
pub use error::{SyncError, SyncResult};
pub use group::{Group, GroupKeys, GroupRecord, GroupRegistry};
pub use identity::Keypair;
pub use invite::{JoinLink, NodeAddrBytes};
pub use log::{EntryBody, LogEntry, LogStore, LogUpdate, Origin, PutOutcome};
pub use node::{Node, NodeInfo};
pub use storage::NodeStorage;
pub use sync::{
    Discovery, Envelope, IrohDiscovery, MemoryNetwork, ReplicationMessage, ReplicationSession,
    SwarmManager, SyncEvent, WireMessage, ENVELOPE_VERSION,
};
pub use types::*;
