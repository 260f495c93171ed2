//! Cluster Listeners
//!
//! [`ClusterListener`] is the single capability the cluster manager drives:
//! inbound replication frames and membership views. The remaining lifecycle
//! callbacks default to no-ops.
//!
//! [`ReplicationListener`] is the listener applying replicated work queues to
//! the local index when this node owns it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::membership::{ClusterNode, View};
use super::ownership::{Ownership, OwnershipResolver};
use crate::backend::{ApplyError, IndexBackend};
use crate::codec::{self, DecodeError};
use crate::work::WorkQueue;

/// What happened to an inbound replication frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Work queue applied to the local index
    Applied { items: usize },
    /// Frame deliberately dropped
    Dropped(DropReason),
}

/// Why an inbound frame was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame originated from this node
    SelfEcho,
    /// Index is not hosted here (it may just have been removed)
    UnknownIndex,
    /// Ownership is unknown, typically mid view transition
    OwnershipUnknown,
    /// Another member owns the index
    NotOwner,
    /// Queue carried no items
    EmptyQueue,
}

/// Failure applying an inbound frame, reported back to a synchronous sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundError {
    /// Frame or work queue could not be decoded
    Decode(String),
    /// Local index rejected the work
    Apply(ApplyError),
}

impl fmt::Display for InboundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundError::Decode(msg) => write!(f, "decode error: {}", msg),
            InboundError::Apply(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for InboundError {}

impl From<DecodeError> for InboundError {
    fn from(err: DecodeError) -> Self {
        InboundError::Decode(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for InboundError {
    fn from(err: bincode::error::DecodeError) -> Self {
        InboundError::Decode(err.to_string())
    }
}

impl From<ApplyError> for InboundError {
    fn from(err: ApplyError) -> Self {
        InboundError::Apply(err)
    }
}

/// Receiver of cluster traffic and membership changes
#[async_trait]
pub trait ClusterListener: Send + Sync {
    /// Handle a replication frame sent by `origin`
    async fn on_message(&self, origin: &str, frame: &[u8]) -> Result<Delivery, InboundError>;

    /// A new membership view has been accepted
    fn on_view_change(&self, view: Arc<View>);

    /// The failure detector started suspecting a member
    fn suspect(&self, _node: &ClusterNode) {}

    /// Membership is about to change
    fn block(&self) {}

    /// Membership change completed
    fn unblock(&self) {}
}

/// Applies replicated work queues to locally owned indexes
pub struct ReplicationListener {
    resolver: Arc<OwnershipResolver>,
    backend: Arc<dyn IndexBackend>,
}

impl ReplicationListener {
    pub fn new(resolver: Arc<OwnershipResolver>, backend: Arc<dyn IndexBackend>) -> Self {
        Self { resolver, backend }
    }
}

#[async_trait]
impl ClusterListener for ReplicationListener {
    async fn on_message(&self, origin: &str, frame: &[u8]) -> Result<Delivery, InboundError> {
        if origin == self.resolver.local_node_id() {
            debug!("Replication: ignoring own frame");
            return Ok(Delivery::Dropped(DropReason::SelfEcho));
        }

        let index_name = codec::decode_index_name(0, frame)?;

        if self.backend.resolve_index(index_name).is_none() {
            info!(
                "Replication: index '{}' from '{}' is not hosted here, dropping",
                index_name, origin
            );
            return Ok(Delivery::Dropped(DropReason::UnknownIndex));
        }

        match self.resolver.ownership(index_name) {
            Ownership::Local => {}
            Ownership::Unknown => {
                warn!(
                    "Replication: ownership of '{}' unknown (view in transition), dropping frame from '{}'",
                    index_name, origin
                );
                return Ok(Delivery::Dropped(DropReason::OwnershipUnknown));
            }
            Ownership::Remote(owner) => {
                debug!(
                    "Replication: '{}' is owned by {}, ignoring frame from '{}'",
                    index_name, owner, origin
                );
                return Ok(Delivery::Dropped(DropReason::NotOwner));
            }
        }

        let payload = codec::decode_payload(0, frame.len(), frame)?;
        let queue = WorkQueue::decode(payload)?;
        if queue.is_empty() {
            debug!(
                "Replication: empty work queue for '{}' from '{}', skipping",
                index_name, origin
            );
            return Ok(Delivery::Dropped(DropReason::EmptyQueue));
        }

        self.backend
            .apply_work_queue(index_name, &queue, queue.tenant_id())
            .await?;

        debug!(
            "Replication: applied {} items to '{}' from '{}'",
            queue.len(),
            index_name,
            origin
        );
        Ok(Delivery::Applied { items: queue.len() })
    }

    fn on_view_change(&self, view: Arc<View>) {
        self.resolver.on_view_change(view);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::backend::MemoryIndexBackend;
    use crate::cluster::ownership::FirstMemberSelector;
    use crate::work::WorkItem;

    fn node(id: &str, port: u16) -> ClusterNode {
        ClusterNode::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn setup(local: &str) -> (ReplicationListener, Arc<OwnershipResolver>, Arc<MemoryIndexBackend>) {
        let resolver = Arc::new(OwnershipResolver::new(local, Box::new(FirstMemberSelector)));
        let backend = Arc::new(MemoryIndexBackend::new(["books"]));
        let listener = ReplicationListener::new(resolver.clone(), backend.clone());
        (listener, resolver, backend)
    }

    fn frame(index: &str, queue: &WorkQueue) -> Vec<u8> {
        codec::encode(index, &queue.encode().unwrap()).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_applies_when_owner() {
        let (listener, _, backend) = setup("a");
        listener.on_view_change(Arc::new(View::new(1, vec![node("a", 1), node("b", 2)])));

        let queue = WorkQueue::for_tenant("acme").with(WorkItem::add("1", b"doc".to_vec()));
        let delivery = listener.on_message("b", &frame("books", &queue)).await.unwrap();

        assert_eq!(delivery, Delivery::Applied { items: 1 });
        assert_eq!(backend.get("books", Some("acme"), "1"), Some(b"doc".to_vec()));
    }

    #[tokio::test]
    async fn test_drops_when_ownership_unknown() {
        let (listener, _, backend) = setup("a");
        let queue = WorkQueue::new().with(WorkItem::add("1", b"doc".to_vec()));

        let delivery = listener.on_message("b", &frame("books", &queue)).await.unwrap();

        assert_eq!(delivery, Delivery::Dropped(DropReason::OwnershipUnknown));
        assert!(backend.applied().is_empty());
    }

    #[tokio::test]
    async fn test_drops_when_not_owner() {
        let (listener, _, backend) = setup("b");
        listener.on_view_change(Arc::new(View::new(1, vec![node("a", 1), node("b", 2)])));
        let queue = WorkQueue::new().with(WorkItem::add("1", b"doc".to_vec()));

        let delivery = listener.on_message("c", &frame("books", &queue)).await.unwrap();

        assert_eq!(delivery, Delivery::Dropped(DropReason::NotOwner));
        assert!(backend.applied().is_empty());
    }

    #[tokio::test]
    async fn test_drops_unknown_index() {
        let (listener, _, _) = setup("a");
        listener.on_view_change(Arc::new(View::new(1, vec![node("a", 1)])));
        let queue = WorkQueue::new().with(WorkItem::add("1", b"doc".to_vec()));

        let delivery = listener.on_message("b", &frame("music", &queue)).await.unwrap();
        assert_eq!(delivery, Delivery::Dropped(DropReason::UnknownIndex));
    }

    #[tokio::test]
    async fn test_skips_empty_queue() {
        let (listener, _, backend) = setup("a");
        listener.on_view_change(Arc::new(View::new(1, vec![node("a", 1)])));

        let delivery = listener
            .on_message("b", &frame("books", &WorkQueue::new()))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Dropped(DropReason::EmptyQueue));
        assert!(backend.applied().is_empty());
    }

    #[tokio::test]
    async fn test_drops_self_echo() {
        let (listener, _, backend) = setup("a");
        listener.on_view_change(Arc::new(View::new(1, vec![node("a", 1)])));
        let queue = WorkQueue::new().with(WorkItem::add("1", b"doc".to_vec()));

        let delivery = listener.on_message("a", &frame("books", &queue)).await.unwrap();
        assert_eq!(delivery, Delivery::Dropped(DropReason::SelfEcho));
        assert!(backend.applied().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_reported() {
        let (listener, _, _) = setup("a");
        listener.on_view_change(Arc::new(View::new(1, vec![node("a", 1)])));
        let bad = codec::encode("books", &[0xFF, 0xFF, 0xFF]).unwrap();

        let err = listener.on_message("b", &bad).await.unwrap_err();
        assert!(matches!(err, InboundError::Decode(_)));
    }

    #[test]
    fn test_lifecycle_callbacks_are_noops() {
        let (listener, resolver, _) = setup("a");
        listener.block();
        listener.suspect(&node("b", 2));
        listener.unblock();
        assert!(resolver.current_view().is_none());
    }
}
