//! indexrelay - Distributed indexing work coordinator
//!
//! Propagates change events into full-text index replicas so that every
//! change is eventually applied to the index that owns it, across node
//! failures and membership changes:
//! - work queues are replicated to the member owning their index
//! - a durable outbox retries failed work and quarantines what keeps failing
//! - operators inspect, reprocess or clear quarantined work

pub mod backend;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod outbox;
pub mod work;

pub use backend::{IndexBackend, MemoryIndexBackend, WorkProducer};
pub use cluster::{ClusterConfig, ClusterManager, OwnershipResolver, ReplicationTransport};
pub use config::Config;
pub use dispatch::{Dispatched, WorkDispatcher};
pub use outbox::{AbortedEventAdmin, FjallOutboxStore, OutboxCoordinator, OutboxStore};
pub use work::{WorkItem, WorkKind, WorkQueue};
