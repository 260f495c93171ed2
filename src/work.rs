//! Indexing Work Model
//!
//! A [`WorkItem`] is one atomic index mutation; a [`WorkQueue`] is the ordered
//! batch of items destined for one index and one tenant. Queues are replayed
//! in submission order, so the last write for an entity wins without any
//! payload inspection.

use bincode::{Decode, Encode};

/// Kind of index mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum WorkKind {
    Add,
    Update,
    Delete,
    /// Remove every document of the index (entity id is ignored)
    PurgeAll,
}

impl WorkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkKind::Add => "add",
            WorkKind::Update => "update",
            WorkKind::Delete => "delete",
            WorkKind::PurgeAll => "purge-all",
        }
    }
}

/// One atomic index mutation
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct WorkItem {
    pub kind: WorkKind,
    pub entity_id: String,
    /// Opaque indexable fields produced by the mapping layer
    pub payload: Vec<u8>,
}

impl WorkItem {
    pub fn add(entity_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: WorkKind::Add,
            entity_id: entity_id.into(),
            payload: payload.into(),
        }
    }

    pub fn update(entity_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: WorkKind::Update,
            entity_id: entity_id.into(),
            payload: payload.into(),
        }
    }

    pub fn delete(entity_id: impl Into<String>) -> Self {
        Self {
            kind: WorkKind::Delete,
            entity_id: entity_id.into(),
            payload: Vec::new(),
        }
    }

    pub fn purge_all() -> Self {
        Self {
            kind: WorkKind::PurgeAll,
            entity_id: String::new(),
            payload: Vec::new(),
        }
    }
}

/// Ordered batch of work items for one index and one tenant
///
/// The tenant travels with the queue so a replicated queue is applied under
/// the same tenant on the receiving node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct WorkQueue {
    tenant_id: Option<String>,
    items: Vec<WorkItem>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            items: Vec::new(),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Same items attributed to `tenant_id`
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn push(&mut self, item: WorkItem) {
        self.items.push(item);
    }

    pub fn with(mut self, item: WorkItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Serialize using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Deserialize from bincode bytes
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(queue, _)| queue)
    }
}

impl FromIterator<WorkItem> for WorkQueue {
    fn from_iter<I: IntoIterator<Item = WorkItem>>(iter: I) -> Self {
        Self {
            tenant_id: None,
            items: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for WorkQueue {
    type Item = WorkItem;
    type IntoIter = std::vec::IntoIter<WorkItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_order() {
        let queue = WorkQueue::new()
            .with(WorkItem::add("1", b"a".to_vec()))
            .with(WorkItem::update("1", b"b".to_vec()))
            .with(WorkItem::delete("1"));

        let decoded = WorkQueue::decode(&queue.encode().unwrap()).unwrap();
        let kinds: Vec<_> = decoded.items().iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![WorkKind::Add, WorkKind::Update, WorkKind::Delete]);
        assert_eq!(decoded, queue);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let queue = WorkQueue::new().with(WorkItem::add("42", b"title=rust".to_vec()));
        let bytes = queue.encode().unwrap();
        assert!(WorkQueue::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_tenant_travels_with_queue() {
        let queue = WorkQueue::for_tenant("acme").with(WorkItem::delete("9"));
        let decoded = WorkQueue::decode(&queue.encode().unwrap()).unwrap();
        assert_eq!(decoded.tenant_id(), Some("acme"));
        assert_eq!(WorkQueue::new().tenant_id(), None);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(WorkKind::PurgeAll.as_str(), "purge-all");
        assert_eq!(WorkKind::Add.as_str(), "add");
    }
}
