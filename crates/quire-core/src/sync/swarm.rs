//! Swarm manager: which groups are being replicated, and with whom
//!
//! For every joined group the manager subscribes to peer discovery under
//! the group's discovery key and runs one [`ReplicationSession`] per
//! connected peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SwarmManager                                                   │
//! │  ├── swarms: HashMap<DiscoveryKey, SwarmState>                  │
//! │  │   ├── listener task: accepts PeerConnections from Discovery  │
//! │  │   └── peers: HashMap<PeerId, ActiveSession>                  │
//! │  │       └── one ReplicationSession task per peer               │
//! │  └── event_tx: broadcast::Sender<SyncEvent>                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A second connection to a peer that already has a session in a group is
//! discarded. A session that ends removes itself from the peer map, so the
//! same peer can be accepted again on a later connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::error::SyncResult;
use crate::group::Group;
use crate::sync::events::SyncEvent;
use crate::sync::session::ReplicationSession;
use crate::sync::transport::{Discovery, PeerConnection, TransportHints};
use crate::types::{DiscoveryKey, PeerId};

/// How long `leave` waits for a session to wind down
const SESSION_SHUTDOWN_WAIT: Duration = Duration::from_secs(3);

struct ActiveSession {
    id: u64,
    task: JoinHandle<()>,
}

/// State for one joined group
struct SwarmState {
    group: Arc<Group>,
    cancel: CancellationToken,
    listener: Option<JoinHandle<()>>,
    peers: HashMap<PeerId, ActiveSession>,
}

/// Manager for the swarms of all joined groups
pub struct SwarmManager<D: Discovery> {
    discovery: Arc<D>,
    config: SwarmConfig,
    swarms: Arc<RwLock<HashMap<DiscoveryKey, SwarmState>>>,
    event_tx: broadcast::Sender<SyncEvent>,
    next_session_id: Arc<AtomicU64>,
}

impl<D: Discovery> Clone for SwarmManager<D> {
    fn clone(&self) -> Self {
        Self {
            discovery: self.discovery.clone(),
            config: self.config.clone(),
            swarms: self.swarms.clone(),
            event_tx: self.event_tx.clone(),
            next_session_id: self.next_session_id.clone(),
        }
    }
}

impl<D: Discovery> SwarmManager<D> {
    pub fn new(discovery: D, config: SwarmConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            discovery: Arc::new(discovery),
            config,
            swarms: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            next_session_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn discovery(&self) -> &Arc<D> {
        &self.discovery
    }

    pub fn local_peer(&self) -> PeerId {
        self.discovery.local_peer()
    }

    /// Subscribe to swarm and session events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Start replicating `group`.
    ///
    /// Returns `false` if the group was already joined.
    pub async fn join(&self, group: Arc<Group>) -> SyncResult<bool> {
        let dk = group.discovery_key();
        let cancel = CancellationToken::new();
        {
            let mut swarms = self.swarms.write().await;
            if swarms.contains_key(&dk) {
                debug!(dk = %dk, "Already joined");
                return Ok(false);
            }
            swarms.insert(
                dk,
                SwarmState {
                    group: group.clone(),
                    cancel: cancel.clone(),
                    listener: None,
                    peers: HashMap::new(),
                },
            );
        }

        let hints = self.resolve_hints(dk, group.bootstrap().to_vec()).await;
        let (conn_tx, conn_rx) = mpsc::channel(self.config.connection_queue);
        if let Err(e) = self.discovery.subscribe(dk, hints, conn_tx).await {
            warn!(dk = %dk, error = %e, "Failed to subscribe to discovery");
            self.swarms.write().await.remove(&dk);
            return Err(e);
        }

        let listener = tokio::spawn(self.clone().listen(dk, conn_rx, cancel.clone()));
        let still_joined = {
            let mut swarms = self.swarms.write().await;
            match swarms.get_mut(&dk) {
                Some(state) if !cancel.is_cancelled() => {
                    state.listener = Some(listener);
                    true
                }
                _ => {
                    listener.abort();
                    false
                }
            }
        };
        if !still_joined {
            // left while we were subscribing
            self.discovery.unsubscribe(&dk).await;
            return Ok(false);
        }

        info!(dk = %dk, "Joined swarm");
        let _ = self.event_tx.send(SyncEvent::Joined { discovery_key: dk });
        Ok(true)
    }

    /// Stop replicating the group with `discovery_key`.
    ///
    /// Closes every session of the group. Returns `false` if it was not joined.
    pub async fn leave(&self, discovery_key: &DiscoveryKey) -> bool {
        let Some(state) = self.swarms.write().await.remove(discovery_key) else {
            debug!(dk = %discovery_key, "Leave for a group that was not joined");
            return false;
        };

        state.cancel.cancel();
        if let Some(listener) = state.listener {
            listener.abort();
        }
        let peer_count = state.peers.len();
        for (peer, session) in state.peers {
            if tokio::time::timeout(SESSION_SHUTDOWN_WAIT, session.task).await.is_err() {
                warn!(dk = %discovery_key, peer = %peer, "Session did not close in time");
            }
        }
        self.discovery.unsubscribe(discovery_key).await;

        info!(dk = %discovery_key, peers = peer_count, "Left swarm");
        let _ = self.event_tx.send(SyncEvent::Left {
            discovery_key: *discovery_key,
        });
        true
    }

    /// Leave every joined group
    pub async fn shutdown(&self) {
        for dk in self.joined().await {
            self.leave(&dk).await;
        }
    }

    /// Total number of open sessions across all groups
    pub async fn count_peers(&self) -> usize {
        self.swarms.read().await.values().map(|s| s.peers.len()).sum()
    }

    /// Peers with an open session in one group
    pub async fn peers(&self, discovery_key: &DiscoveryKey) -> Vec<PeerId> {
        self.swarms
            .read()
            .await
            .get(discovery_key)
            .map(|s| s.peers.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_joined(&self, discovery_key: &DiscoveryKey) -> bool {
        self.swarms.read().await.contains_key(discovery_key)
    }

    pub async fn joined(&self) -> Vec<DiscoveryKey> {
        self.swarms.read().await.keys().copied().collect()
    }

    async fn resolve_hints(
        &self,
        dk: DiscoveryKey,
        bootstrap: Vec<crate::invite::NodeAddrBytes>,
    ) -> TransportHints {
        let resolve = self.discovery.resolve_hints(dk, bootstrap.clone());
        match tokio::time::timeout(self.config.hint_timeout(), resolve).await {
            Ok(Ok(hints)) => hints,
            Ok(Err(e)) => {
                warn!(dk = %dk, error = %e, "Failed to resolve transport hints, using defaults");
                TransportHints::fallback(bootstrap)
            }
            Err(_) => {
                warn!(dk = %dk, "Transport hint resolution timed out, using defaults");
                TransportHints::fallback(bootstrap)
            }
        }
    }

    async fn listen(
        self,
        dk: DiscoveryKey,
        mut connections: mpsc::Receiver<PeerConnection>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                conn = connections.recv() => match conn {
                    Some(conn) => self.accept(dk, conn).await,
                    None => {
                        debug!(dk = %dk, "Discovery closed the connection channel");
                        break;
                    }
                },
            }
        }
    }

    /// Start a session for a new connection, unless it is redundant
    async fn accept(&self, dk: DiscoveryKey, conn: PeerConnection) {
        let local_peer = self.discovery.local_peer();
        let peer = conn.peer;
        if peer == local_peer {
            debug!(dk = %dk, "Discarding connection to self");
            return;
        }

        let mut swarms = self.swarms.write().await;
        let Some(state) = swarms.get_mut(&dk) else {
            return;
        };
        if state.peers.contains_key(&peer) {
            debug!(dk = %dk, peer = %peer, "Duplicate connection, discarding");
            return;
        }
        if state.peers.len() >= self.config.max_peers_per_group {
            debug!(dk = %dk, peer = %peer, max = self.config.max_peers_per_group, "Peer limit reached, discarding");
            return;
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = ReplicationSession::new(
            state.group.store().clone(),
            conn.stream,
            local_peer,
            peer,
            &self.config,
        )
        .with_events(self.event_tx.clone())
        .with_cancel(state.cancel.child_token());

        let manager = self.clone();
        let task = tokio::spawn(async move {
            // outcome is logged by the session itself
            let _ = session.run().await;
            manager.remove_session(dk, peer, id).await;
        });

        debug!(dk = %dk, peer = %peer, session = id, "Session started");
        state.peers.insert(peer, ActiveSession { id, task });
    }

    async fn remove_session(&self, dk: DiscoveryKey, peer: PeerId, id: u64) {
        let mut swarms = self.swarms.write().await;
        if let Some(state) = swarms.get_mut(&dk) {
            if state.peers.get(&peer).map(|s| s.id) == Some(id) {
                state.peers.remove(&peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKeys;
    use crate::identity::Keypair;
    use crate::sync::transport::MemoryNetwork;

    fn group(keys: &GroupKeys) -> Arc<Group> {
        Arc::new(Group::in_memory(keys.clone(), Keypair::generate(), 64).unwrap())
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let network = MemoryNetwork::new();
        let manager = SwarmManager::new(network.discovery(PeerId([1; 32])), SwarmConfig::default());
        let g = group(&GroupKeys::generate());

        assert!(manager.join(g.clone()).await.unwrap());
        assert!(!manager.join(g.clone()).await.unwrap());
        assert!(manager.is_joined(&g.discovery_key()).await);
        assert_eq!(network.member_count(&g.discovery_key()), 1);
    }

    #[tokio::test]
    async fn test_leave_without_join_is_safe() {
        let network = MemoryNetwork::new();
        let manager = SwarmManager::new(network.discovery(PeerId([1; 32])), SwarmConfig::default());

        assert!(!manager.leave(&DiscoveryKey([9; 32])).await);
        assert_eq!(manager.count_peers().await, 0);
    }

    #[tokio::test]
    async fn test_leave_unsubscribes() {
        let network = MemoryNetwork::new();
        let manager = SwarmManager::new(network.discovery(PeerId([1; 32])), SwarmConfig::default());
        let g = group(&GroupKeys::generate());
        let mut events = manager.subscribe();

        manager.join(g.clone()).await.unwrap();
        assert!(manager.leave(&g.discovery_key()).await);

        assert!(!manager.is_joined(&g.discovery_key()).await);
        assert_eq!(network.member_count(&g.discovery_key()), 0);
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Joined { .. }));
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Left { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_hint_resolution_falls_back() {
        let network = MemoryNetwork::new();
        let discovery = network
            .discovery(PeerId([1; 32]))
            .with_hint_delay(Duration::from_secs(60));
        let manager = SwarmManager::new(discovery, SwarmConfig::default());
        let g = group(&GroupKeys::generate());

        assert!(manager.join(g.clone()).await.unwrap());
        assert_eq!(network.member_count(&g.discovery_key()), 1);
    }
}
