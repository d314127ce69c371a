//! Replication layer
//!
//! ## Overview
//!
//! Every group is a swarm keyed by its discovery key. Peers that find each
//! other open one duplex stream per group and run a replication session on
//! it: a handshake proving knowledge of the replication key, then
//! offer/request/entry exchanges until both sides hold the same logs.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SwarmManager<D: Discovery>                                     │
//! │  ├── join / leave / count_peers                                 │
//! │  └── per group: one ReplicationSession per peer                 │
//! │                                                                 │
//! │  Discovery                                                      │
//! │  ├── IrohDiscovery (gossip topic + QUIC streams)                │
//! │  └── MemoryNetwork (in-process pipes)                           │
//! │                                                                 │
//! │  ReplicationSession                                             │
//! │  ├── Framed<stream, ReplicationCodec>                           │
//! │  └── LogStore (put / get / subscribe)                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! - **Handshake**: discovery key, nonce and keyed-hash proof
//! - **Offer**: announce a (writer, index) the sender holds
//! - **Request**: ask for one entry
//! - **Entry**: the signed, encrypted envelope
//! - **Invalid**: diagnostic for an entry that failed validation
//! - **Error**: terminal; the sender closes the session

pub mod envelope;
pub mod events;
pub mod network;
pub mod protocol;
pub mod session;
pub mod swarm;
pub mod transport;

pub use envelope::{Envelope, ENVELOPE_VERSION};
pub use events::SyncEvent;
pub use network::{IrohDiscovery, REPLICATION_ALPN};
pub use protocol::{ReplicationCodec, ReplicationMessage, WireMessage};
pub use session::{ReplicationSession, SessionState, SessionSummary};
pub use swarm::SwarmManager;
pub use transport::{Discovery, MemoryDiscovery, MemoryNetwork, PeerConnection, TransportHints};
