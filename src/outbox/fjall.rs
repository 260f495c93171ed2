//! Fjall-based outbox store.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! Events are keyed by their big-endian id, so key order is creation order.
//! The next id is persisted in a meta partition together with each insert,
//! so ids are never reused once their events are deleted.
//! Read-modify-write transitions run under a single writer guard, which makes
//! each of them an atomic compare-and-set over the event status.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;
use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::models::{EventStatus, FailOutcome, OutboxEvent, Partition};
use super::store::OutboxStore;

/// Meta key holding the next event id
const NEXT_ID_KEY: &[u8] = b"next_id";

/// Fjall-based outbox store
pub struct FjallOutboxStore {
    keyspace: Keyspace,
    events: PartitionHandle,
    meta: PartitionHandle,
    next_id: AtomicU64,
    write_guard: Mutex<()>,
}

impl FjallOutboxStore {
    /// Open a fjall store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let keyspace = Config::new(path).open()?;
        let events = keyspace.open_partition("outbox_events", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("outbox_meta", PartitionCreateOptions::default())?;

        let after_last = match events.iter().next_back() {
            Some(item) => {
                let (_, value) = item?;
                let last: OutboxEvent = Self::deserialize(&value)?;
                last.id + 1
            }
            None => 1,
        };
        let high_water = match meta.get(NEXT_ID_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                    StoreError::Deserialize(format!("corrupt next id ({} bytes)", bytes.len()))
                })?;
                u64::from_be_bytes(raw)
            }
            None => 1,
        };
        let next_id = after_last.max(high_water);
        debug!("Outbox store opened, next event id {}", next_id);

        Ok(Self {
            keyspace,
            events,
            meta,
            next_id: AtomicU64::new(next_id),
            write_guard: Mutex::new(()),
        })
    }

    fn key(id: u64) -> [u8; 8] {
        id.to_be_bytes()
    }

    /// Serialize a value using bincode
    fn serialize<T: bincode::Encode>(value: &T) -> StoreResult<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(StoreError::from)
    }

    /// Deserialize a value using bincode
    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> StoreResult<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(StoreError::from)
    }

    /// Every event, oldest first
    fn scan(&self) -> StoreResult<Vec<OutboxEvent>> {
        let mut result = Vec::new();
        for item in self.events.iter() {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }

    fn load(&self, id: u64) -> StoreResult<Option<OutboxEvent>> {
        match self.events.get(Self::key(id))? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write updated events in one atomic batch
    fn write_all(&self, events: &[OutboxEvent]) -> StoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut batch = self.keyspace.batch();
        for event in events {
            batch.insert(&self.events, Self::key(event.id), Self::serialize(event)?);
        }
        batch.commit()?;
        Ok(())
    }

    /// Delete events in one atomic batch
    fn remove_all(&self, ids: &[u64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut batch = self.keyspace.batch();
        for id in ids {
            batch.remove(&self.events, Self::key(*id));
        }
        batch.commit()?;
        Ok(())
    }

    fn append_sync(
        &self,
        tenant_id: Option<&str>,
        index_name: &str,
        payload: Vec<u8>,
        now_ms: u64,
    ) -> StoreResult<OutboxEvent> {
        let event = {
            // Id order and high-water mark writes stay in step
            let _guard = self.write_guard.lock();
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let event = OutboxEvent::new(
                id,
                tenant_id.map(str::to_string),
                index_name,
                payload,
                now_ms,
            );

            let mut batch = self.keyspace.batch();
            batch.insert(&self.events, Self::key(id), Self::serialize(&event)?);
            batch.insert(&self.meta, NEXT_ID_KEY, Self::key(id + 1));
            batch.commit()?;
            event
        };
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(event)
    }

    fn claim_sync(
        &self,
        tenant: Option<&str>,
        partition: Partition,
        limit: usize,
        now_ms: u64,
    ) -> StoreResult<Vec<OutboxEvent>> {
        let _guard = self.write_guard.lock();

        let mut claimed = Vec::new();
        for item in self.events.iter() {
            if claimed.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let mut event: OutboxEvent = Self::deserialize(&value)?;
            if event.is_claimable(now_ms)
                && event.matches_tenant(tenant)
                && partition.contains(event.id)
            {
                event.status = EventStatus::Processing;
                claimed.push(event);
            }
        }

        self.write_all(&claimed)?;
        Ok(claimed)
    }

    fn fail_sync(
        &self,
        ids: &[u64],
        error: &str,
        max_retries: u32,
        retry_at_ms: u64,
    ) -> StoreResult<FailOutcome> {
        let _guard = self.write_guard.lock();

        let mut outcome = FailOutcome::default();
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut event) = self.load(*id)? else {
                debug!("Outbox: event {} vanished before failing", id);
                continue;
            };
            if event.status != EventStatus::Processing {
                debug!(
                    "Outbox: event {} is {}, not failing it",
                    id,
                    event.status.as_str()
                );
                continue;
            }

            let retry_count = event.retry_count.saturating_add(1);
            event.retry_count = retry_count;
            event.last_error = Some(error.to_string());
            if retry_count > max_retries {
                event.status = EventStatus::Aborted;
                outcome.aborted.push(event.id);
            } else {
                event.status = EventStatus::Pending;
                event.available_at_ms = retry_at_ms;
                outcome.retried.push(event.id);
            }
            updated.push(event);
        }

        self.write_all(&updated)?;
        Ok(outcome)
    }

    fn release_sync(&self, ids: &[u64]) -> StoreResult<usize> {
        let _guard = self.write_guard.lock();

        let mut released = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut event) = self.load(*id)? {
                if event.status == EventStatus::Processing {
                    event.status = EventStatus::Pending;
                    released.push(event);
                }
            }
        }

        self.write_all(&released)?;
        Ok(released.len())
    }

    fn complete_sync(&self, ids: &[u64]) -> StoreResult<()> {
        let _guard = self.write_guard.lock();
        self.remove_all(ids)
    }

    fn count_sync(&self, tenant: Option<&str>, status: EventStatus) -> StoreResult<usize> {
        Ok(self
            .scan()?
            .iter()
            .filter(|e| e.status == status && e.matches_tenant(tenant))
            .count())
    }

    fn reprocess_sync(&self, tenant: Option<&str>, now_ms: u64) -> StoreResult<usize> {
        let _guard = self.write_guard.lock();

        let reprocessed: Vec<OutboxEvent> = self
            .scan()?
            .into_iter()
            .filter(|e| e.status == EventStatus::Aborted && e.matches_tenant(tenant))
            .map(|mut e| {
                e.status = EventStatus::Pending;
                e.retry_count = 0;
                e.available_at_ms = now_ms;
                e
            })
            .collect();

        self.write_all(&reprocessed)?;
        Ok(reprocessed.len())
    }

    fn clear_sync(&self, tenant: Option<&str>) -> StoreResult<usize> {
        let _guard = self.write_guard.lock();

        let ids: Vec<u64> = self
            .scan()?
            .iter()
            .filter(|e| e.status == EventStatus::Aborted && e.matches_tenant(tenant))
            .map(|e| e.id)
            .collect();

        self.remove_all(&ids)?;
        Ok(ids.len())
    }

    fn reset_processing_sync(&self) -> StoreResult<usize> {
        let _guard = self.write_guard.lock();

        let recovered: Vec<OutboxEvent> = self
            .scan()?
            .into_iter()
            .filter(|e| e.status == EventStatus::Processing)
            .map(|mut e| {
                e.status = EventStatus::Pending;
                e
            })
            .collect();

        self.write_all(&recovered)?;
        Ok(recovered.len())
    }
}

#[async_trait]
impl OutboxStore for FjallOutboxStore {
    async fn append(
        &self,
        tenant_id: Option<&str>,
        index_name: &str,
        payload: Vec<u8>,
        now_ms: u64,
    ) -> StoreResult<OutboxEvent> {
        self.append_sync(tenant_id, index_name, payload, now_ms)
    }

    async fn get(&self, id: u64) -> StoreResult<Option<OutboxEvent>> {
        self.load(id)
    }

    async fn claim_pending(
        &self,
        tenant: Option<&str>,
        partition: Partition,
        limit: usize,
        now_ms: u64,
    ) -> StoreResult<Vec<OutboxEvent>> {
        self.claim_sync(tenant, partition, limit, now_ms)
    }

    async fn complete(&self, ids: &[u64]) -> StoreResult<()> {
        self.complete_sync(ids)
    }

    async fn fail(
        &self,
        ids: &[u64],
        error: &str,
        max_retries: u32,
        retry_at_ms: u64,
    ) -> StoreResult<FailOutcome> {
        self.fail_sync(ids, error, max_retries, retry_at_ms)
    }

    async fn release(&self, ids: &[u64]) -> StoreResult<usize> {
        self.release_sync(ids)
    }

    async fn count(&self, tenant: Option<&str>, status: EventStatus) -> StoreResult<usize> {
        self.count_sync(tenant, status)
    }

    async fn reprocess_aborted(&self, tenant: Option<&str>, now_ms: u64) -> StoreResult<usize> {
        self.reprocess_sync(tenant, now_ms)
    }

    async fn clear_aborted(&self, tenant: Option<&str>) -> StoreResult<usize> {
        self.clear_sync(tenant)
    }

    async fn reset_processing(&self) -> StoreResult<usize> {
        self.reset_processing_sync()
    }

    async fn flush(&self) -> StoreResult<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
