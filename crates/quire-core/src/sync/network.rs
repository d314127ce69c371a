//! Peer discovery and connections over iroh
//!
//! Each group's discovery key doubles as an iroh-gossip topic. Gossip is only
//! used to learn who else is in the swarm; replication itself runs on a
//! dedicated QUIC stream per peer pair.
//!
//! ## Connection setup
//!
//! ```text
//! gossip NeighborUp(peer) on topic = discovery key
//!   |
//!   |-- local id < peer id --> connect(peer, REPLICATION_ALPN)
//!   |                            open_bi, write 32-byte discovery key
//!   |
//!   '-- otherwise -----------> wait; the peer dials us and the router
//!                              hands the stream to ReplicationHandler
//! ```
//!
//! The stream is then delivered to the swarm, which runs the handshake.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, RecvStream, SendStream, VarInt};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointId, SecretKey};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::invite::NodeAddrBytes;
use crate::sync::transport::{Discovery, PeerConnection, TransportHints};
use crate::types::{DiscoveryKey, PeerId};

/// ALPN for replication streams
pub const REPLICATION_ALPN: &[u8] = b"/quire/replication/1";

/// Gossip only carries membership, so frames stay small
const GOSSIP_MAX_MESSAGE_SIZE: usize = 4096;

type Routes = Arc<RwLock<HashMap<DiscoveryKey, mpsc::Sender<PeerConnection>>>>;

/// A QUIC bidirectional stream as one duplex byte stream.
///
/// Closes the connection when dropped so the accepting side can finish.
pub struct IrohStream {
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
}

impl AsyncRead for IrohStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for IrohStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

impl Drop for IrohStream {
    fn drop(&mut self) {
        self.connection
            .close(VarInt::from_u32(0), b"replication session closed");
    }
}

fn peer_id(id: &EndpointId) -> PeerId {
    PeerId::from_bytes(*id.as_bytes())
}

/// Router handler for incoming replication connections
#[derive(Debug, Clone)]
pub struct ReplicationHandler {
    routes: Routes,
}

impl ReplicationHandler {
    async fn handle_connection(routes: Routes, connection: Connection) -> SyncResult<()> {
        let remote = connection.remote_id();
        let (send, mut recv) = connection
            .accept_bi()
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to accept stream: {}", e)))?;

        let mut preface = [0u8; 32];
        recv.read_exact(&mut preface)
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to read preface: {}", e)))?;
        let dk = DiscoveryKey::from_bytes(preface);

        let route = routes.read().get(&dk).cloned();
        let Some(route) = route else {
            debug!(peer = %remote, dk = %dk, "Connection for a group we are not in");
            connection.close(VarInt::from_u32(1), b"unknown group");
            return Ok(());
        };

        let stream = IrohStream {
            connection: connection.clone(),
            send,
            recv,
        };
        if route.send(PeerConnection::new(peer_id(&remote), stream)).await.is_err() {
            return Ok(());
        }

        // Hold the connection until the session is done with it
        connection.closed().await;
        Ok(())
    }
}

impl ProtocolHandler for ReplicationHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let routes = self.routes.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting replication connection");
            if let Err(e) = Self::handle_connection(routes, conn).await {
                warn!(error = %e, "Failed to handle replication connection");
                return Err(AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}

struct TopicTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// [`Discovery`] backed by an iroh endpoint and iroh-gossip
#[derive(Debug)]
pub struct IrohDiscovery {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for addresses from join links
    static_provider: StaticProvider,
    routes: Routes,
    topics: parking_lot::Mutex<HashMap<DiscoveryKey, TopicTask>>,
}

impl std::fmt::Debug for TopicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicTask").finish_non_exhaustive()
    }
}

impl IrohDiscovery {
    /// Bind an endpoint with `secret_key` and start the protocol router
    pub async fn bind(secret_key: SecretKey) -> SyncResult<Self> {
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec(), REPLICATION_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(GOSSIP_MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let routes: Routes = Arc::default();
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(
                REPLICATION_ALPN,
                ReplicationHandler {
                    routes: routes.clone(),
                },
            )
            .spawn();

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            routes,
            topics: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// This node's address in join-link form
    pub fn node_addr(&self) -> NodeAddrBytes {
        NodeAddrBytes::from_endpoint_addr(&self.endpoint.addr())
    }

    async fn watch_topic(
        endpoint: Endpoint,
        dk: DiscoveryKey,
        sender: iroh_gossip::api::GossipSender,
        mut receiver: iroh_gossip::api::GossipReceiver,
        connections: mpsc::Sender<PeerConnection>,
        cancel: CancellationToken,
    ) {
        use iroh_gossip::api::Event;
        use n0_future::StreamExt;

        // dropping the sender would leave the topic
        let _sender = sender;
        let local = endpoint.id();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.try_next() => event,
            };
            match event {
                Ok(Some(Event::NeighborUp(peer))) => {
                    debug!(dk = %dk, ?peer, "Neighbor joined");
                    if local.as_bytes() < peer.as_bytes() {
                        let endpoint = endpoint.clone();
                        let connections = connections.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::dial(endpoint, dk, peer, connections).await {
                                warn!(dk = %dk, ?peer, error = %e, "Failed to dial neighbor");
                            }
                        });
                    }
                }
                Ok(Some(Event::NeighborDown(peer))) => {
                    debug!(dk = %dk, ?peer, "Neighbor left");
                }
                Ok(Some(Event::Lagged)) => {
                    warn!(dk = %dk, "Lagged behind on topic");
                }
                Ok(Some(Event::Received(_))) => {}
                Ok(None) => {
                    debug!(dk = %dk, "Topic subscription closed");
                    break;
                }
                Err(e) => {
                    warn!(dk = %dk, error = ?e, "Error receiving from topic");
                    break;
                }
            }
        }
    }

    async fn dial(
        endpoint: Endpoint,
        dk: DiscoveryKey,
        peer: EndpointId,
        connections: mpsc::Sender<PeerConnection>,
    ) -> SyncResult<()> {
        let connection = endpoint
            .connect(peer, REPLICATION_ALPN)
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to connect: {}", e)))?;
        let (mut send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to open stream: {}", e)))?;
        send.write_all(dk.as_bytes())
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to send preface: {}", e)))?;

        let stream = IrohStream {
            connection,
            send,
            recv,
        };
        // a closed channel means the group was left; the stream closes on drop
        let _ = connections.send(PeerConnection::new(peer_id(&peer), stream)).await;
        Ok(())
    }
}

impl Discovery for IrohDiscovery {
    fn local_peer(&self) -> PeerId {
        peer_id(&self.endpoint.id())
    }

    fn local_addr(&self) -> Option<NodeAddrBytes> {
        Some(self.node_addr())
    }

    async fn resolve_hints(
        &self,
        _discovery_key: DiscoveryKey,
        bootstrap: Vec<NodeAddrBytes>,
    ) -> SyncResult<TransportHints> {
        for peer in &bootstrap {
            self.static_provider.add_endpoint_info(peer.to_endpoint_addr()?);
        }
        self.endpoint.online().await;
        let relay_url = self.endpoint.addr().relay_urls().next().map(|u| u.to_string());
        Ok(TransportHints {
            bootstrap,
            relay_url,
        })
    }

    async fn subscribe(
        &self,
        discovery_key: DiscoveryKey,
        hints: TransportHints,
        connections: mpsc::Sender<PeerConnection>,
    ) -> SyncResult<()> {
        let mut bootstrap_ids = Vec::with_capacity(hints.bootstrap.len());
        for peer in &hints.bootstrap {
            let addr = peer.to_endpoint_addr()?;
            bootstrap_ids.push(addr.id);
            self.static_provider.add_endpoint_info(addr);
        }

        info!(dk = %discovery_key, peer_count = bootstrap_ids.len(), "Subscribing to topic");
        let topic = self
            .gossip
            .subscribe(TopicId::from_bytes(*discovery_key.as_bytes()), bootstrap_ids)
            .await
            .map_err(|e| SyncError::Gossip(format!("Failed to subscribe: {}", e)))?;
        let (sender, receiver) = topic.split();

        self.routes.write().insert(discovery_key, connections.clone());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::watch_topic(
            self.endpoint.clone(),
            discovery_key,
            sender,
            receiver,
            connections,
            cancel.clone(),
        ));
        if let Some(previous) = self
            .topics
            .lock()
            .insert(discovery_key, TopicTask { cancel, task })
        {
            previous.cancel.cancel();
        }
        Ok(())
    }

    async fn unsubscribe(&self, discovery_key: &DiscoveryKey) {
        self.routes.write().remove(discovery_key);
        let topic = self.topics.lock().remove(discovery_key);
        if let Some(topic) = topic {
            topic.cancel.cancel();
            debug!(dk = %discovery_key, "Unsubscribed from topic");
        }
    }

    /// Stop all topics and shut down the router
    async fn shutdown(&self) {
        let topics: Vec<_> = self.topics.lock().drain().collect();
        for (_, topic) in topics {
            topic.cancel.cancel();
            topic.task.abort();
        }
        self.routes.write().clear();
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shut down router cleanly");
        }
    }
}
