//! Work Dispatching
//!
//! Entry point for change events. The dispatcher turns changes into a work
//! queue through the [`WorkProducer`], asks the [`OwnershipResolver`] who
//! owns the target index and then:
//! - applies the queue directly when the local node owns the index
//! - replicates it when another member owns the index
//! - records it in the outbox when ownership is unknown or delivery failed
//!
//! The queue always carries the validated tenant, so every path applies it
//! under the same tenant.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{IndexBackend, WorkProducer};
use crate::cluster::{Ownership, OwnershipResolver, ReplicationTransport, SendMode};
use crate::outbox::{OutboxCoordinator, Result, TenantError};
use crate::work::WorkQueue;

/// Where a dispatched work queue ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// No change produced any work
    Skipped,
    /// Applied to the local index
    Applied,
    /// Handed to the owning member
    Replicated { owner: String },
    /// Durably recorded for the outbox processor
    Queued { event_id: u64 },
}

/// Routes work queues to the node owning their index
pub struct WorkDispatcher<P: WorkProducer> {
    producer: P,
    resolver: Arc<OwnershipResolver>,
    backend: Arc<dyn IndexBackend>,
    transport: Option<Arc<dyn ReplicationTransport>>,
    outbox: Arc<OutboxCoordinator>,
    send_mode: SendMode,
}

impl<P: WorkProducer> WorkDispatcher<P> {
    pub fn new(
        producer: P,
        resolver: Arc<OwnershipResolver>,
        backend: Arc<dyn IndexBackend>,
        outbox: Arc<OutboxCoordinator>,
    ) -> Self {
        Self {
            producer,
            resolver,
            backend,
            transport: None,
            outbox,
            send_mode: SendMode::Async,
        }
    }

    /// Replicate remotely owned work over `transport` using `mode`
    pub fn with_transport(mut self, transport: Arc<dyn ReplicationTransport>, mode: SendMode) -> Self {
        self.transport = Some(transport);
        self.send_mode = mode;
        self
    }

    /// Produce work for a set of changes and route it
    pub async fn dispatch(
        &self,
        tenant_id: Option<&str>,
        index_name: &str,
        changes: &[P::Change],
    ) -> Result<Dispatched> {
        let mut queue = match tenant_id {
            Some(tenant) => WorkQueue::for_tenant(tenant),
            None => WorkQueue::new(),
        };
        for item in changes.iter().filter_map(|c| self.producer.produce_work_item(c)) {
            queue.push(item);
        }
        self.submit(tenant_id, index_name, queue).await
    }

    /// Route an already built work queue
    pub async fn submit(
        &self,
        tenant_id: Option<&str>,
        index_name: &str,
        queue: WorkQueue,
    ) -> Result<Dispatched> {
        let tenant = self.outbox.tenancy().resolve(tenant_id)?;
        let queue = match (queue.tenant_id().map(str::to_string), tenant) {
            (None, Some(tenant)) => queue.with_tenant(tenant),
            (Some(queue_tenant), _) if Some(queue_tenant.as_str()) != tenant => {
                return Err(TenantError::QueueTenantMismatch {
                    queue_tenant,
                    tenant_id: tenant.map(str::to_string),
                }
                .into());
            }
            _ => queue,
        };
        if queue.is_empty() {
            debug!("Dispatch: nothing to do for index '{}'", index_name);
            return Ok(Dispatched::Skipped);
        }

        match self.resolver.ownership(index_name) {
            Ownership::Local => match self.backend.apply_work_queue(index_name, &queue, tenant).await {
                Ok(()) => {
                    debug!(
                        "Dispatch: applied {} items to local index '{}'",
                        queue.len(),
                        index_name
                    );
                    Ok(Dispatched::Applied)
                }
                Err(e) => {
                    warn!(
                        "Dispatch: local apply to '{}' failed ({}), deferring to outbox",
                        index_name, e
                    );
                    self.enqueue(tenant, index_name, &queue).await
                }
            },
            Ownership::Remote(owner) => {
                let Some(transport) = &self.transport else {
                    warn!(
                        "Dispatch: index '{}' owned by {} but no transport, deferring to outbox",
                        index_name, owner
                    );
                    return self.enqueue(tenant, index_name, &queue).await;
                };
                match transport.send(index_name, &queue, self.send_mode).await {
                    Ok(()) => {
                        debug!(
                            "Dispatch: replicated {} items for '{}' to {}",
                            queue.len(),
                            index_name,
                            owner
                        );
                        Ok(Dispatched::Replicated {
                            owner: owner.node_id,
                        })
                    }
                    Err(e) => {
                        warn!(
                            "Dispatch: replication of '{}' to {} failed ({}), deferring to outbox",
                            index_name, owner, e
                        );
                        self.enqueue(tenant, index_name, &queue).await
                    }
                }
            }
            Ownership::Unknown => {
                debug!(
                    "Dispatch: ownership of '{}' unknown, deferring to outbox",
                    index_name
                );
                self.enqueue(tenant, index_name, &queue).await
            }
        }
    }

    async fn enqueue(
        &self,
        tenant: Option<&str>,
        index_name: &str,
        queue: &WorkQueue,
    ) -> Result<Dispatched> {
        let event = self.outbox.append(tenant, index_name, queue).await?;
        Ok(Dispatched::Queued { event_id: event.id })
    }
}
