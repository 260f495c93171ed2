//! Durable outbox records.

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};

/// Lifecycle state of an outbox event
///
/// `Pending -> Processing -> {deleted | Pending (retry) | Aborted}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum EventStatus {
    Pending,
    Processing,
    /// Retry budget exhausted, waiting for an operator
    Aborted,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Aborted => "aborted",
        }
    }
}

/// A durably stored work queue that has not been applied yet
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct OutboxEvent {
    /// Monotonic id; id order is creation order
    pub id: u64,
    pub tenant_id: Option<String>,
    pub index_name: String,
    /// Serialized work queue
    pub payload: Vec<u8>,
    pub retry_count: u32,
    pub status: EventStatus,
    /// Unix timestamp in milliseconds
    pub created_at_ms: u64,
    /// Not claimable before this time (retry delay)
    pub available_at_ms: u64,
    /// Message of the most recent failed attempt
    pub last_error: Option<String>,
}

impl OutboxEvent {
    pub fn new(
        id: u64,
        tenant_id: Option<String>,
        index_name: impl Into<String>,
        payload: Vec<u8>,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            tenant_id,
            index_name: index_name.into(),
            payload,
            retry_count: 0,
            status: EventStatus::Pending,
            created_at_ms: now_ms,
            available_at_ms: now_ms,
            last_error: None,
        }
    }

    /// Whether the event belongs to `tenant`; `None` matches every event
    pub fn matches_tenant(&self, tenant: Option<&str>) -> bool {
        match tenant {
            Some(tenant) => self.tenant_id.as_deref() == Some(tenant),
            None => true,
        }
    }

    /// Whether a poller can claim this event now
    pub fn is_claimable(&self, now_ms: u64) -> bool {
        self.status == EventStatus::Pending && self.available_at_ms <= now_ms
    }
}

/// Slice of the event id space polled by one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: u32,
    pub count: u32,
}

impl Partition {
    /// The whole id space
    pub const ALL: Partition = Partition { index: 0, count: 1 };

    pub fn new(index: u32, count: u32) -> Self {
        let count = count.max(1);
        Self {
            index: index % count,
            count,
        }
    }

    pub fn contains(&self, event_id: u64) -> bool {
        event_id % u64::from(self.count) == u64::from(self.index)
    }
}

/// Result of failing a batch: which events were rescheduled and which
/// exhausted their retry budget
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailOutcome {
    pub retried: Vec<u64>,
    pub aborted: Vec<u64>,
}

/// Result of one polling round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing to claim
    Idle,
    /// Every event of the batch was applied and deleted
    Applied { events: usize },
    /// Execution failed; the whole batch was rescheduled or aborted
    Failed { error: String, outcome: FailOutcome },
}

/// Current Unix time in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_is_pending() {
        let event = OutboxEvent::new(1, None, "books", vec![1], 1_000);
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert!(event.is_claimable(1_000));
        assert!(!event.is_claimable(999));
    }

    #[test]
    fn test_tenant_matching() {
        let event = OutboxEvent::new(1, Some("acme".into()), "books", vec![], 0);
        assert!(event.matches_tenant(None));
        assert!(event.matches_tenant(Some("acme")));
        assert!(!event.matches_tenant(Some("globex")));
    }

    #[test]
    fn test_partitions_are_disjoint() {
        let partitions: Vec<_> = (0..3).map(|i| Partition::new(i, 3)).collect();
        for id in 0..30u64 {
            assert_eq!(partitions.iter().filter(|p| p.contains(id)).count(), 1);
        }
        assert!(Partition::ALL.contains(17));
        assert_eq!(Partition::new(0, 0), Partition::ALL);
    }
}
