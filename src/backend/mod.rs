//! Index Backend Interfaces
//!
//! The index engine and the entity mapping layer live outside this crate.
//! They are consumed through the traits defined here:
//! - [`IndexBackend`]: resolve a local index and apply a work queue to it
//! - [`WorkProducer`]: turn a change event into a work item
//!
//! `MemoryIndexBackend` is a reference implementation keeping documents in
//! memory; the node binary and the tests run against it.

mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::work::{WorkItem, WorkQueue};

pub use memory::{AppliedOp, MemoryIndexBackend};

/// Error returned by an index backend when applying work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Index is not hosted by this backend
    IndexNotFound(String),
    /// Backend refused the work (bad payload, schema mismatch, ...)
    Rejected(String),
    /// Backend is temporarily unable to write
    Unavailable(String),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyError::IndexNotFound(name) => write!(f, "index not found: {}", name),
            ApplyError::Rejected(msg) => write!(f, "work rejected: {}", msg),
            ApplyError::Unavailable(msg) => write!(f, "index unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ApplyError {}

/// Handle on an index hosted by the local backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHandle {
    pub name: String,
}

/// Local index engine
///
/// Applying a queue must be idempotent: retries replay the same queue, so
/// adds and updates have to collapse into upserts.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Look up a locally hosted index
    fn resolve_index(&self, index_name: &str) -> Option<IndexHandle>;

    /// Apply every item of `queue`, in order, to the named index
    async fn apply_work_queue(
        &self,
        index_name: &str,
        queue: &WorkQueue,
        tenant_id: Option<&str>,
    ) -> Result<(), ApplyError>;
}

/// Mapping layer producing work items from change events
pub trait WorkProducer: Send + Sync {
    type Change;

    /// Produce the work item for a change, or `None` if it is not indexed
    fn produce_work_item(&self, change: &Self::Change) -> Option<WorkItem>;
}
