//! Node: groups on disk plus the swarm that replicates them
//!
//! `Node` ties the [`GroupRegistry`] to a [`SwarmManager`]. Networking is
//! started explicitly; until then the node works fully offline and local
//! appends are simply stored.
//!
//! # Example
//!
//! ```ignore
//! use quire_core::{Node, SwarmConfig};
//!
//! let mut node = Node::open("~/.quire", SwarmConfig::default())?;
//! let group = node.create_group("Field notes", true).await?;
//! node.start_network().await?;
//! let link = node.invite(&group.discovery_key())?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::SwarmConfig;
use crate::error::SyncResult;
use crate::group::{Group, GroupRegistry};
use crate::invite::JoinLink;
use crate::log::{EntryBody, LogEntry};
use crate::sync::{Discovery, IrohDiscovery, SwarmManager, SyncEvent};
use crate::types::DiscoveryKey;

/// A local node and, once started, its swarm
pub struct Node<D: Discovery = IrohDiscovery> {
    data_dir: PathBuf,
    config: SwarmConfig,
    registry: GroupRegistry,
    swarm: Option<SwarmManager<D>>,
}

impl<D: Discovery> Node<D> {
    /// Open the node stored in `data_dir`, creating it if needed.
    pub fn open(data_dir: impl AsRef<Path>, config: SwarmConfig) -> SyncResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        info!(?data_dir, "Opening node");
        config.validate()?;
        std::fs::create_dir_all(&data_dir)?;
        let registry = GroupRegistry::open(&data_dir, config.clone())?;

        Ok(Self {
            data_dir,
            config,
            registry,
            swarm: None,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn swarm(&self) -> Option<&SwarmManager<D>> {
        self.swarm.as_ref()
    }

    pub fn is_networking_active(&self) -> bool {
        self.swarm.is_some()
    }

    /// Start replicating every active group over `discovery`
    pub async fn start_with(&mut self, discovery: D) -> SyncResult<()> {
        if self.swarm.is_some() {
            return Ok(());
        }
        let swarm = SwarmManager::new(discovery, self.config.clone());
        for group in self.registry.open_all()? {
            swarm.join(group).await?;
        }
        info!(peer = %swarm.local_peer(), "Networking started");
        self.swarm = Some(swarm);
        Ok(())
    }

    /// Subscribe to replication events; `None` while offline
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SyncEvent>> {
        self.swarm.as_ref().map(|s| s.subscribe())
    }

    pub async fn create_group(&self, title: &str, persistent: bool) -> SyncResult<Arc<Group>> {
        let group = self.registry.create(title, persistent)?;
        if let Some(swarm) = &self.swarm {
            swarm.join(group.clone()).await?;
        }
        Ok(group)
    }

    /// Join a group from an encoded join link
    pub async fn join_group(&self, link: &str, persistent: bool) -> SyncResult<Arc<Group>> {
        let link = JoinLink::decode(link)?;
        let group = self.registry.join(&link, persistent)?;
        if let Some(swarm) = &self.swarm {
            swarm.join(group.clone()).await?;
        }
        Ok(group)
    }

    /// Stop replicating a group and delete it locally, keeping a tombstone
    pub async fn leave_group(&self, dk: &DiscoveryKey) -> SyncResult<bool> {
        if let Some(swarm) = &self.swarm {
            swarm.leave(dk).await;
        }
        self.registry.leave(dk)
    }

    /// Append to this node's log in a group; connected peers get an offer.
    pub fn append(&self, dk: &DiscoveryKey, body: &EntryBody) -> SyncResult<LogEntry> {
        self.registry.append(dk, body)
    }

    /// Encoded join link, with this node as bootstrap peer when online
    pub fn invite(&self, dk: &DiscoveryKey) -> SyncResult<String> {
        let bootstrap = self
            .swarm
            .as_ref()
            .and_then(|s| s.discovery().local_addr())
            .into_iter()
            .collect();
        self.registry.invite(dk, bootstrap)?.encode()
    }

    /// Open sessions across all groups
    pub async fn count_peers(&self) -> usize {
        match &self.swarm {
            Some(swarm) => swarm.count_peers().await,
            None => 0,
        }
    }

    /// Summary for display
    pub fn info(&self) -> SyncResult<NodeInfo> {
        let endpoint_id = self
            .registry
            .storage()
            .load_endpoint_secret_key()?
            .map(|bytes| iroh::SecretKey::from(bytes).public().to_string());
        let peer_id = self.swarm.as_ref().map(|s| s.local_peer().to_base58());

        Ok(NodeInfo {
            data_dir: self.data_dir.clone(),
            group_count: self.registry.list()?.len(),
            endpoint_id,
            peer_id,
        })
    }

    /// Leave all swarms and release the transport
    pub async fn shutdown(self) {
        info!("Shutting down node");
        if let Some(swarm) = self.swarm {
            swarm.shutdown().await;
            swarm.discovery().shutdown().await;
        }
    }
}

impl Node<IrohDiscovery> {
    /// Bind the iroh endpoint with this node's persistent key and start replicating
    pub async fn start_network(&mut self) -> SyncResult<()> {
        if self.swarm.is_some() {
            return Ok(());
        }
        let storage = self.registry.storage();
        let secret_key = match storage.load_endpoint_secret_key()? {
            Some(bytes) => iroh::SecretKey::from(bytes),
            None => {
                info!("No endpoint secret key found, generating new one");
                let secret_key = iroh::SecretKey::generate(&mut rand::rng());
                storage.save_endpoint_secret_key(&secret_key.to_bytes())?;
                secret_key
            }
        };

        let discovery = IrohDiscovery::bind(secret_key).await?;
        if let Err(e) = self.start_with(discovery).await {
            warn!(error = %e, "Failed to start replication");
            return Err(e);
        }
        Ok(())
    }
}

/// Information about this node
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub data_dir: PathBuf,
    /// Number of active groups
    pub group_count: usize,
    /// iroh endpoint id, once networking has been started at least once
    pub endpoint_id: Option<String>,
    /// Transport identity while networking is active
    pub peer_id: Option<String>,
}
