//! Cluster Configuration
//!
//! Configuration types for gossip membership and work queue replication.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

use crate::cluster::OwnershipStrategy;

/// Cluster configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Node identifier (auto-generated from hostname if not set)
    pub node_id: Option<String>,

    /// Gossip cluster name; nodes with a different name ignore each other
    pub cluster_id: String,

    /// Address for gossip protocol (chitchat) to bind to
    /// Default: 0.0.0.0:7946
    pub gossip_addr: SocketAddr,

    /// Advertise address for gossip protocol (what peers use to reach us)
    /// If not set, resolved from hostname or falls back to gossip_addr
    pub gossip_advertise_addr: Option<SocketAddr>,

    /// Address for replication connections to bind to
    /// Default: 0.0.0.0:7947
    pub peer_addr: SocketAddr,

    /// Advertise address for replication connections
    /// If not set, resolved from hostname or falls back to peer_addr
    pub peer_advertise_addr: Option<SocketAddr>,

    /// Seed nodes for cluster discovery
    /// Format: "host:port" (gossip port)
    pub seeds: Vec<String>,

    /// Gossip interval (e.g. "1s")
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// Bound on replication connection attempts and handshakes
    #[serde(with = "humantime_serde")]
    pub failure_timeout: Duration,

    /// Dead node grace period before removal
    #[serde(with = "humantime_serde")]
    pub dead_node_grace_period: Duration,

    /// Default timeout of synchronous replication sends
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,

    /// How the owner of an index is picked from the membership
    pub ownership: OwnershipStrategy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            cluster_id: "indexrelay".to_string(),
            gossip_addr: SocketAddr::from(([0, 0, 0, 0], 7946)),
            gossip_advertise_addr: None,
            peer_addr: SocketAddr::from(([0, 0, 0, 0], 7947)),
            peer_advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(5),
            dead_node_grace_period: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            ownership: OwnershipStrategy::default(),
        }
    }
}

impl ClusterConfig {
    /// Get the node ID, generating from hostname if not set
    pub fn get_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("node-{}", rand_id()))
        })
    }

    /// Get the gossip advertise address (what peers use to reach us)
    /// Priority: explicit config > resolved hostname > bind address
    pub fn get_gossip_advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.gossip_advertise_addr {
            return addr;
        }
        advertise_for(self.gossip_addr)
    }

    /// Get the peer advertise address (what peers use to reach us)
    /// Priority: explicit config > resolved hostname > bind address
    pub fn get_peer_advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.peer_advertise_addr {
            return addr;
        }
        advertise_for(self.peer_addr)
    }
}

/// Bind addresses on a specific interface are advertised as-is; wildcard
/// binds advertise the hostname's address
fn advertise_for(bind: SocketAddr) -> SocketAddr {
    if !bind.ip().is_unspecified() {
        return bind;
    }
    match resolve_local_ip() {
        Some(ip) => SocketAddr::new(ip, bind.port()),
        None => bind,
    }
}

/// Resolve the local machine's IP address by resolving the hostname
fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    let addr_str = format!("{}:0", hostname.to_string_lossy());
    addr_str
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}

/// Generate a random ID for node identification
fn rand_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xFFFFFFFF)
}
