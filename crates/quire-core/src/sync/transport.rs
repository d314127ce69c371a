//! Transport seam between the swarm and peer discovery
//!
//! The swarm only needs "a duplex byte stream to a peer who also knows this
//! discovery key". A [`Discovery`] implementation finds such peers and hands
//! each new connection over as a [`PeerConnection`].
//!
//! [`MemoryNetwork`] is an in-process implementation: every member
//! subscribed to the same discovery key gets connected to every other one
//! through `tokio::io::duplex` pipes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::invite::NodeAddrBytes;
use crate::types::{DiscoveryKey, PeerId};

/// Any bidirectional byte stream usable by a session
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// A freshly established connection to a peer for one group
pub struct PeerConnection {
    /// Transport-authenticated identity of the remote side
    pub peer: PeerId,
    pub stream: BoxedStream,
}

impl PeerConnection {
    pub fn new(peer: PeerId, stream: impl DuplexStream) -> Self {
        Self {
            peer,
            stream: Box::new(stream),
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Resolved transport configuration for one group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHints {
    /// Peers to contact first
    pub bootstrap: Vec<NodeAddrBytes>,
    /// Relay the local node should advertise, if any
    pub relay_url: Option<String>,
}

impl TransportHints {
    /// Defaults used when resolution fails or times out
    pub fn fallback(bootstrap: Vec<NodeAddrBytes>) -> Self {
        Self {
            bootstrap,
            relay_url: None,
        }
    }
}

/// Peer discovery and connection establishment
pub trait Discovery: Send + Sync + 'static {
    /// This node's transport identity
    fn local_peer(&self) -> PeerId;

    /// Address other nodes can dial, for join links
    fn local_addr(&self) -> Option<NodeAddrBytes> {
        None
    }

    /// Resolve relay and bootstrap configuration for a group.
    ///
    /// The swarm bounds this with a timeout and falls back to defaults.
    fn resolve_hints(
        &self,
        discovery_key: DiscoveryKey,
        bootstrap: Vec<NodeAddrBytes>,
    ) -> impl Future<Output = SyncResult<TransportHints>> + Send;

    /// Start finding peers for `discovery_key`; deliver connections on `connections`.
    fn subscribe(
        &self,
        discovery_key: DiscoveryKey,
        hints: TransportHints,
        connections: mpsc::Sender<PeerConnection>,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Stop finding peers for `discovery_key`. Safe if never subscribed.
    fn unsubscribe(&self, discovery_key: &DiscoveryKey) -> impl Future<Output = ()> + Send;

    /// Release transport resources
    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-process network
// ═══════════════════════════════════════════════════════════════════════════

/// Pipe buffer size for in-process connections
const PIPE_CAPACITY: usize = 64 * 1024;

type Members = HashMap<DiscoveryKey, Vec<(PeerId, mpsc::Sender<PeerConnection>)>>;

/// Rendezvous shared by all [`MemoryDiscovery`] handles
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    members: Arc<Mutex<Members>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A discovery handle for the node `peer`
    pub fn discovery(&self, peer: PeerId) -> MemoryDiscovery {
        MemoryDiscovery {
            network: self.clone(),
            peer,
            hint_delay: None,
        }
    }

    /// Open one more connection between two subscribed members.
    ///
    /// Each side receives it as newly discovered, like a redundant
    /// connection produced by a real transport.
    pub async fn connect(&self, discovery_key: DiscoveryKey, a: PeerId, b: PeerId) -> SyncResult<()> {
        let (tx_a, tx_b) = {
            let members = self.members.lock();
            let group = members.get(&discovery_key);
            let find = |peer: PeerId| {
                group
                    .and_then(|g| g.iter().find(|(p, _)| *p == peer))
                    .map(|(_, tx)| tx.clone())
                    .ok_or_else(|| {
                        SyncError::Transport(format!("{} is not subscribed to {}", peer, discovery_key))
                    })
            };
            (find(a)?, find(b)?)
        };
        pipe(a, tx_a, b, tx_b).await;
        Ok(())
    }

    /// Number of members subscribed to `discovery_key`
    pub fn member_count(&self, discovery_key: &DiscoveryKey) -> usize {
        self.members
            .lock()
            .get(discovery_key)
            .map(|g| g.len())
            .unwrap_or(0)
    }
}

/// Connect `a` and `b` with a fresh pipe, delivering each end to the other side's owner
async fn pipe(
    a: PeerId,
    tx_a: mpsc::Sender<PeerConnection>,
    b: PeerId,
    tx_b: mpsc::Sender<PeerConnection>,
) {
    let (end_a, end_b) = tokio::io::duplex(PIPE_CAPACITY);
    // A closed receiver means that member is leaving; the pipe is just dropped
    let _ = tx_a.send(PeerConnection::new(b, end_a)).await;
    let _ = tx_b.send(PeerConnection::new(a, end_b)).await;
}

/// [`Discovery`] over a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryDiscovery {
    network: MemoryNetwork,
    peer: PeerId,
    hint_delay: Option<Duration>,
}

impl MemoryDiscovery {
    /// Make hint resolution take `delay`, to exercise the swarm's fallback
    pub fn with_hint_delay(mut self, delay: Duration) -> Self {
        self.hint_delay = Some(delay);
        self
    }
}

impl Discovery for MemoryDiscovery {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    async fn resolve_hints(
        &self,
        _discovery_key: DiscoveryKey,
        bootstrap: Vec<NodeAddrBytes>,
    ) -> SyncResult<TransportHints> {
        if let Some(delay) = self.hint_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(TransportHints {
            bootstrap,
            relay_url: None,
        })
    }

    async fn subscribe(
        &self,
        discovery_key: DiscoveryKey,
        _hints: TransportHints,
        connections: mpsc::Sender<PeerConnection>,
    ) -> SyncResult<()> {
        let others = {
            let mut members = self.network.members.lock();
            let group = members.entry(discovery_key).or_default();
            group.retain(|(peer, _)| *peer != self.peer);
            let others: Vec<_> = group.clone();
            group.push((self.peer, connections.clone()));
            others
        };

        debug!(dk = %discovery_key, peer = %self.peer, existing = others.len(), "Joined in-memory swarm");
        for (other, tx_other) in others {
            pipe(self.peer, connections.clone(), other, tx_other).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, discovery_key: &DiscoveryKey) {
        let mut members = self.network.members.lock();
        if let Some(group) = members.get_mut(discovery_key) {
            group.retain(|(peer, _)| *peer != self.peer);
            if group.is_empty() {
                members.remove(discovery_key);
            }
        }
    }
}
