//! Storage trait for outbox events.
//!
//! This trait defines the interface for outbox stores, allowing different
//! implementations (fjall, PostgreSQL, etc.). Every state transition is a
//! conditional update: it only touches events still in the expected status,
//! so concurrent callers never act on the same event twice.

use async_trait::async_trait;

use super::error::StoreResult;
use super::models::{EventStatus, FailOutcome, OutboxEvent, Partition};

/// Durable store of outbox events
///
/// `tenant` arguments restrict an operation to one tenant; `None` means
/// every event.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Record a new pending event
    async fn append(
        &self,
        tenant_id: Option<&str>,
        index_name: &str,
        payload: Vec<u8>,
        now_ms: u64,
    ) -> StoreResult<OutboxEvent>;

    /// Get an event by id
    async fn get(&self, id: u64) -> StoreResult<Option<OutboxEvent>>;

    /// Move up to `limit` claimable events to processing, oldest first
    async fn claim_pending(
        &self,
        tenant: Option<&str>,
        partition: Partition,
        limit: usize,
        now_ms: u64,
    ) -> StoreResult<Vec<OutboxEvent>>;

    /// Delete applied events
    async fn complete(&self, ids: &[u64]) -> StoreResult<()>;

    /// Reschedule failed events at `retry_at_ms`, or abort those whose retry
    /// count would exceed `max_retries`
    async fn fail(
        &self,
        ids: &[u64],
        error: &str,
        max_retries: u32,
        retry_at_ms: u64,
    ) -> StoreResult<FailOutcome>;

    /// Return claimed events to pending untouched, after a batch could not
    /// be settled
    async fn release(&self, ids: &[u64]) -> StoreResult<usize>;

    /// Count events in a status
    async fn count(&self, tenant: Option<&str>, status: EventStatus) -> StoreResult<usize>;

    /// Move aborted events back to pending with a fresh retry budget
    async fn reprocess_aborted(&self, tenant: Option<&str>, now_ms: u64) -> StoreResult<usize>;

    /// Permanently delete aborted events
    async fn clear_aborted(&self, tenant: Option<&str>) -> StoreResult<usize>;

    /// Return every processing event to pending (startup recovery)
    async fn reset_processing(&self) -> StoreResult<usize>;

    /// Flush to durable storage
    async fn flush(&self) -> StoreResult<()>;
}
