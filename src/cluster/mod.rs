//! Cluster Module
//!
//! Replicates indexing work between nodes and tracks which node owns each
//! index.
//!
//! # Architecture
//!
//! The cluster uses two communication channels:
//! - **Gossip (UDP via chitchat)**: Node discovery, membership, failure detection
//! - **Peer TCP**: Replication frames and their acknowledgments
//!
//! Every accepted membership [`View`] is handed to the [`ClusterListener`],
//! which forwards it to the [`OwnershipResolver`].
//!
//! # Usage
//!
//! ```toml
//! # indexrelay.toml
//! [cluster]
//! enabled = true
//! gossip_addr = "0.0.0.0:7946"
//! peer_addr = "0.0.0.0:7947"
//! seeds = ["node1:7946", "node2:7946"]
//! ownership = "rendezvous"
//! ```

mod error;
mod listener;
mod manager;
mod membership;
mod ownership;
mod peer;
mod protocol;
mod replication;

pub use error::{PeerStatus, RemoteError, SendError};
pub use listener::{ClusterListener, Delivery, DropReason, InboundError, ReplicationListener};
pub use manager::{ClusterManager, NodeAnnouncement};
pub use membership::{ClusterNode, NodeStatus, View};
pub use ownership::{
    FirstMemberSelector, OwnerSelector, Ownership, OwnershipResolver, OwnershipStrategy,
    RendezvousSelector,
};
pub use peer::ClusterPeer;
pub use protocol::{ClusterMessage, CLUSTER_PROTOCOL_VERSION};
pub use replication::{ReplicationTransport, SendMode};

// Re-export cluster config
pub use crate::config::ClusterConfig;
