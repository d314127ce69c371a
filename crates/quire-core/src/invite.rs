//! Join links for sharing groups with peers
//!
//! A join link carries everything needed to become a member of a group:
//! - Replication key (proves membership during the handshake)
//! - Encryption key for entry bodies
//! - Group signing key pair (countersigns every entry)
//! - Bootstrap peers for the first connection
//!
//! Links are encoded as `quire-join:{base58}` strings for easy sharing.
//! Anyone holding a link can read and write the group; treat it as a secret.

use std::net::SocketAddr;

use iroh::{EndpointAddr, PublicKey, RelayUrl};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::group::GroupKeys;
use crate::types::DiscoveryKey;

/// Prefix for encoded join links
const JOIN_PREFIX: &str = "quire-join:";

/// Current link format version
const LINK_VERSION: u8 = 1;

/// Serializable representation of a peer's network address.
///
/// Portable format shared in join links, containing all information needed
/// to connect to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddrBytes {
    /// Node's public key (32 bytes)
    pub node_id: [u8; 32],
    /// Optional relay URL for NAT traversal
    pub relay_url: Option<String>,
    /// Direct socket addresses as strings (e.g., "192.168.1.1:4433")
    pub direct_addresses: Vec<String>,
}

impl NodeAddrBytes {
    pub fn new(node_id: [u8; 32]) -> Self {
        Self {
            node_id,
            relay_url: None,
            direct_addresses: Vec::new(),
        }
    }

    pub fn with_relay(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = Some(relay_url.into());
        self
    }

    pub fn with_address(mut self, addr: impl Into<String>) -> Self {
        self.direct_addresses.push(addr.into());
        self
    }

    pub fn from_endpoint_addr(addr: &EndpointAddr) -> Self {
        Self {
            node_id: addr.id.as_bytes().to_owned(),
            relay_url: addr.relay_urls().next().map(|url| url.to_string()),
            direct_addresses: addr.ip_addrs().map(|a| a.to_string()).collect(),
        }
    }

    /// Convert back to an iroh [`EndpointAddr`]
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidInvite` if the key, relay URL or a socket
    /// address is malformed.
    pub fn to_endpoint_addr(&self) -> Result<EndpointAddr, SyncError> {
        let public_key = PublicKey::from_bytes(&self.node_id)
            .map_err(|e| SyncError::InvalidInvite(format!("Invalid public key: {}", e)))?;

        let mut addr = EndpointAddr::new(public_key);

        if let Some(ref relay_str) = self.relay_url {
            let relay_url: RelayUrl = relay_str
                .parse()
                .map_err(|e| SyncError::InvalidInvite(format!("Invalid relay URL: {}", e)))?;
            addr = addr.with_relay_url(relay_url);
        }

        for addr_str in &self.direct_addresses {
            let socket_addr: SocketAddr = addr_str
                .parse()
                .map_err(|e| SyncError::InvalidInvite(format!("Invalid socket address: {}", e)))?;
            addr = addr.with_ip_addr(socket_addr);
        }

        Ok(addr)
    }
}

impl From<&EndpointAddr> for NodeAddrBytes {
    fn from(addr: &EndpointAddr) -> Self {
        Self::from_endpoint_addr(addr)
    }
}

impl TryFrom<&NodeAddrBytes> for EndpointAddr {
    type Error = SyncError;

    fn try_from(bytes: &NodeAddrBytes) -> Result<Self, Self::Error> {
        bytes.to_endpoint_addr()
    }
}

/// Everything a node needs to join a group
///
/// # Example
///
/// ```
/// use quire_core::group::GroupKeys;
/// use quire_core::invite::JoinLink;
///
/// let keys = GroupKeys::generate();
/// let link = JoinLink::new(&keys, "Field notes", vec![]);
///
/// let encoded = link.encode().unwrap();
/// assert!(encoded.starts_with("quire-join:"));
///
/// let decoded = JoinLink::decode(&encoded).unwrap();
/// assert_eq!(decoded.discovery_key(), keys.discovery_key());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinLink {
    /// Link format version
    pub version: u8,
    pub replication_key: [u8; 32],
    pub encryption_key: [u8; 32],
    pub group_public_key: [u8; 32],
    pub group_secret_key: [u8; 32],
    /// Human-readable group title
    pub title: Option<String>,
    /// Peers to contact when joining
    pub bootstrap_peers: Vec<NodeAddrBytes>,
}

impl JoinLink {
    pub fn new(keys: &GroupKeys, title: impl Into<String>, bootstrap_peers: Vec<NodeAddrBytes>) -> Self {
        let title = title.into();
        Self {
            version: LINK_VERSION,
            replication_key: *keys.replication_key(),
            encryption_key: *keys.encryption_key(),
            group_public_key: keys.group_public_key(),
            group_secret_key: keys.group_keypair().secret_bytes(),
            title: (!title.is_empty()).then_some(title),
            bootstrap_peers,
        }
    }

    /// Encode the link as a `quire-join:{base58}` string.
    pub fn encode(&self) -> Result<String, SyncError> {
        let bytes = postcard::to_stdvec(self)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode join link: {}", e)))?;
        Ok(format!("{}{}", JOIN_PREFIX, bs58::encode(&bytes).into_string()))
    }

    /// Decode a link from a `quire-join:{base58}` string.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidInvite` if the prefix, base58, payload or
    /// version is wrong, or if the group key pair is inconsistent.
    pub fn decode(s: &str) -> Result<Self, SyncError> {
        let data = s.trim().strip_prefix(JOIN_PREFIX).ok_or_else(|| {
            SyncError::InvalidInvite(format!(
                "Invalid prefix: expected '{}', got '{}'",
                JOIN_PREFIX,
                s.chars().take(15).collect::<String>()
            ))
        })?;

        let bytes = bs58::decode(data)
            .into_vec()
            .map_err(|e| SyncError::InvalidInvite(format!("Invalid base58: {}", e)))?;

        let link: JoinLink = postcard::from_bytes(&bytes)
            .map_err(|e| SyncError::InvalidInvite(format!("Invalid link data: {}", e)))?;

        if link.version != LINK_VERSION {
            return Err(SyncError::InvalidInvite(format!(
                "Unsupported link version {}",
                link.version
            )));
        }
        if link.keys().group_public_key() != link.group_public_key {
            return Err(SyncError::InvalidInvite(
                "Group public key does not match secret key".to_string(),
            ));
        }

        Ok(link)
    }

    pub fn keys(&self) -> GroupKeys {
        GroupKeys::from_parts(self.replication_key, self.encryption_key, self.group_secret_key)
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        crate::group::derive_discovery_key(&self.replication_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0x01;
        id[31] = 0xFF;
        id
    }

    #[test]
    fn test_link_carries_keys_and_peers() {
        let keys = GroupKeys::generate();
        let peer = NodeAddrBytes::new(test_node_id())
            .with_relay("https://relay.example.com")
            .with_address("192.168.1.1:4433");

        let link = JoinLink::new(&keys, "Shared notes", vec![peer.clone()]);
        let decoded = JoinLink::decode(&link.encode().unwrap()).unwrap();

        assert_eq!(decoded, link);
        assert_eq!(decoded.title.as_deref(), Some("Shared notes"));
        assert_eq!(decoded.bootstrap_peers, vec![peer]);

        let rebuilt = decoded.keys();
        assert_eq!(rebuilt.discovery_key(), keys.discovery_key());
        assert_eq!(rebuilt.encryption_key(), keys.encryption_key());
        assert_eq!(rebuilt.group_public_key(), keys.group_public_key());
    }

    #[test]
    fn test_empty_title_is_none() {
        let link = JoinLink::new(&GroupKeys::generate(), "", vec![]);
        assert_eq!(link.title, None);
    }

    #[test]
    fn test_decode_rejects_bad_prefix() {
        let err = JoinLink::decode("sync-invite:abc").unwrap_err();
        assert!(matches!(err, SyncError::InvalidInvite(_)));
    }

    #[test]
    fn test_decode_rejects_bad_base58() {
        let err = JoinLink::decode("quire-join:0OIl").unwrap_err();
        assert!(matches!(err, SyncError::InvalidInvite(_)));
    }

    #[test]
    fn test_decode_rejects_mismatched_group_key() {
        let mut link = JoinLink::new(&GroupKeys::generate(), "x", vec![]);
        link.group_public_key = [7; 32];
        let encoded = link.encode().unwrap();
        assert!(matches!(
            JoinLink::decode(&encoded),
            Err(SyncError::InvalidInvite(_))
        ));
    }

    #[test]
    fn test_node_addr_to_endpoint_addr() {
        let secret = iroh::SecretKey::generate(&mut rand::rng());
        let bytes = NodeAddrBytes::new(*secret.public().as_bytes()).with_address("127.0.0.1:4433");

        let addr = bytes.to_endpoint_addr().unwrap();
        assert_eq!(addr.id, secret.public());
        assert_eq!(NodeAddrBytes::from(&addr), bytes);
    }

    #[test]
    fn test_node_addr_rejects_bad_socket() {
        let secret = iroh::SecretKey::generate(&mut rand::rng());
        let bytes = NodeAddrBytes::new(*secret.public().as_bytes()).with_address("not-an-addr");
        assert!(matches!(
            bytes.to_endpoint_addr(),
            Err(SyncError::InvalidInvite(_))
        ));
    }
}
