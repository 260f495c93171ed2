//! Cluster membership snapshots.

use std::fmt;
use std::net::SocketAddr;

/// Liveness of a cluster member as seen by the local failure detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Gossiping normally
    Alive,
    /// Failure detector stopped hearing from it
    Suspected,
    /// Announced it is leaving the cluster
    Departed,
}

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterNode {
    pub node_id: String,
    /// Address of its replication listener
    pub peer_addr: SocketAddr,
    pub status: NodeStatus,
}

impl ClusterNode {
    pub fn new(node_id: impl Into<String>, peer_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            peer_addr,
            status: NodeStatus::Alive,
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_alive(&self) -> bool {
        self.status == NodeStatus::Alive
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.peer_addr)
    }
}

/// Snapshot of the cluster membership
///
/// Members are kept in canonical order (by node id), so two views built from
/// the same membership compare equal regardless of discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    id: u64,
    nodes: Vec<ClusterNode>,
}

impl View {
    pub fn new(id: u64, mut nodes: Vec<ClusterNode>) -> Self {
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes.dedup_by(|a, b| a.node_id == b.node_id);
        Self { id, nodes }
    }

    /// View with no members, used before the first membership round
    pub fn empty() -> Self {
        Self {
            id: 0,
            nodes: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, node_id: &str) -> Option<&ClusterNode> {
        self.nodes
            .binary_search_by(|n| n.node_id.as_str().cmp(node_id))
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node(node_id).is_some()
    }

    /// Members currently alive, in canonical order
    pub fn alive(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter().filter(|n| n.is_alive())
    }

    /// Whether both views describe the same members with the same liveness
    pub fn same_membership(&self, other: &View) -> bool {
        self.nodes == other.nodes
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view#{} [", self.id)?;
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", node.node_id)?;
            if node.status != NodeStatus::Alive {
                write!(f, " ({:?})", node.status)?;
            }
        }
        write!(f, "]")
    }
}
