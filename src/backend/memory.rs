//! In-memory index backend.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{ApplyError, IndexBackend, IndexHandle};
use crate::work::{WorkKind, WorkQueue};

/// Documents of one index for one tenant, keyed by entity id
type Documents = BTreeMap<String, Vec<u8>>;

/// One applied operation, recorded for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOp {
    pub index_name: String,
    pub tenant_id: Option<String>,
    pub kind: WorkKind,
    pub entity_id: String,
}

/// Index backend holding documents in memory
#[derive(Default)]
pub struct MemoryIndexBackend {
    indexes: RwLock<HashSet<String>>,
    documents: DashMap<(Option<String>, String), Documents>,
    log: Mutex<Vec<AppliedOp>>,
}

impl MemoryIndexBackend {
    /// Create a backend hosting the given indexes
    pub fn new<I, S>(index_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backend = Self::default();
        backend
            .indexes
            .write()
            .extend(index_names.into_iter().map(Into::into));
        backend
    }

    /// Start hosting an index
    pub fn create_index(&self, index_name: &str) {
        self.indexes.write().insert(index_name.to_string());
    }

    /// Stop hosting an index and drop its documents
    pub fn drop_index(&self, index_name: &str) {
        self.indexes.write().remove(index_name);
        self.documents.retain(|(_, name), _| name != index_name);
    }

    /// Get a document
    pub fn get(&self, index_name: &str, tenant_id: Option<&str>, entity_id: &str) -> Option<Vec<u8>> {
        self.documents
            .get(&(tenant_id.map(str::to_string), index_name.to_string()))
            .and_then(|docs| docs.get(entity_id).cloned())
    }

    /// Number of documents in an index for a tenant
    pub fn document_count(&self, index_name: &str, tenant_id: Option<&str>) -> usize {
        self.documents
            .get(&(tenant_id.map(str::to_string), index_name.to_string()))
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    /// Every operation applied so far, in application order
    pub fn applied(&self) -> Vec<AppliedOp> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl IndexBackend for MemoryIndexBackend {
    fn resolve_index(&self, index_name: &str) -> Option<IndexHandle> {
        self.indexes.read().contains(index_name).then(|| IndexHandle {
            name: index_name.to_string(),
        })
    }

    async fn apply_work_queue(
        &self,
        index_name: &str,
        queue: &WorkQueue,
        tenant_id: Option<&str>,
    ) -> Result<(), ApplyError> {
        if self.resolve_index(index_name).is_none() {
            return Err(ApplyError::IndexNotFound(index_name.to_string()));
        }

        let key = (tenant_id.map(str::to_string), index_name.to_string());
        let mut docs = self.documents.entry(key).or_default();
        let mut log = self.log.lock();

        for item in queue.items() {
            match item.kind {
                // Add and update collapse into an upsert
                WorkKind::Add | WorkKind::Update => {
                    docs.insert(item.entity_id.clone(), item.payload.clone());
                }
                WorkKind::Delete => {
                    docs.remove(&item.entity_id);
                }
                WorkKind::PurgeAll => docs.clear(),
            }
            log.push(AppliedOp {
                index_name: index_name.to_string(),
                tenant_id: tenant_id.map(str::to_string),
                kind: item.kind,
                entity_id: item.entity_id.clone(),
            });
        }

        debug!(
            "Applied {} work items to index '{}' (tenant={:?})",
            queue.len(),
            index_name,
            tenant_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkItem;

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let backend = MemoryIndexBackend::new(["books"]);
        let queue = WorkQueue::new()
            .with(WorkItem::add("1", b"v1".to_vec()))
            .with(WorkItem::update("1", b"v2".to_vec()))
            .with(WorkItem::add("2", b"x".to_vec()))
            .with(WorkItem::delete("2"));

        backend.apply_work_queue("books", &queue, None).await.unwrap();
        assert_eq!(backend.get("books", None, "1"), Some(b"v2".to_vec()));
        assert_eq!(backend.get("books", None, "2"), None);

        // Replaying the same queue leaves the same state
        backend.apply_work_queue("books", &queue, None).await.unwrap();
        assert_eq!(backend.document_count("books", None), 1);
        assert_eq!(backend.applied().len(), 8);
    }

    #[tokio::test]
    async fn test_purge_all_is_tenant_scoped() {
        let backend = MemoryIndexBackend::new(["books"]);
        let add = WorkQueue::new().with(WorkItem::add("1", b"v".to_vec()));
        backend.apply_work_queue("books", &add, Some("a")).await.unwrap();
        backend.apply_work_queue("books", &add, Some("b")).await.unwrap();

        let purge = WorkQueue::new().with(WorkItem::purge_all());
        backend.apply_work_queue("books", &purge, Some("a")).await.unwrap();

        assert_eq!(backend.document_count("books", Some("a")), 0);
        assert_eq!(backend.document_count("books", Some("b")), 1);
    }

    #[tokio::test]
    async fn test_unknown_index() {
        let backend = MemoryIndexBackend::new(["books"]);
        assert!(backend.resolve_index("music").is_none());
        let err = backend
            .apply_work_queue("music", &WorkQueue::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, ApplyError::IndexNotFound("music".to_string()));

        backend.create_index("music");
        assert!(backend.resolve_index("music").is_some());
        backend.drop_index("music");
        assert!(backend.resolve_index("music").is_none());
    }
}
