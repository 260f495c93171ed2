//! Outbox Event Coordinator
//!
//! Polls durably stored events, applies their work queues to the local index
//! and turns failures into retry or abort transitions. One worker runs per
//! configured partition; each claims only the events of its partition.

use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::{IntCounter, Opts, Registry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::admin::AbortedEventAdmin;
use super::error::{OutboxError, Result, StoreError};
use super::models::{unix_millis, BatchOutcome, OutboxEvent, Partition};
use super::store::OutboxStore;
use super::tenancy::TenancyPolicy;
use crate::backend::IndexBackend;
use crate::config::OutboxConfig;
use crate::work::WorkQueue;

/// Outbox processing counters, registered in their own prometheus registry
#[derive(Clone)]
pub struct OutboxStats {
    registry: Registry,
    appended: IntCounter,
    batches: IntCounter,
    applied: IntCounter,
    retried: IntCounter,
    aborted: IntCounter,
    errors: IntCounter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStatsSnapshot {
    pub appended: u64,
    pub batches: u64,
    pub applied: u64,
    pub retried: u64,
    pub aborted: u64,
    pub errors: u64,
}

impl OutboxStats {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let appended = counter(
            "indexrelay_outbox_appended_total",
            "Events appended to the outbox",
        )?;
        let batches = counter(
            "indexrelay_outbox_batches_total",
            "Batches claimed for processing",
        )?;
        let applied = counter(
            "indexrelay_outbox_applied_total",
            "Events applied and deleted",
        )?;
        let retried = counter(
            "indexrelay_outbox_retried_total",
            "Events rescheduled after a failed batch",
        )?;
        let aborted = counter(
            "indexrelay_outbox_aborted_total",
            "Events aborted after exhausting their retries",
        )?;
        let errors = counter(
            "indexrelay_outbox_errors_total",
            "Store errors seen by the polling workers",
        )?;

        Ok(Self {
            registry,
            appended,
            batches,
            applied,
            retried,
            aborted,
            errors,
        })
    }

    /// Registry holding every outbox counter
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> OutboxStatsSnapshot {
        OutboxStatsSnapshot {
            appended: self.appended.get(),
            batches: self.batches.get(),
            applied: self.applied.get(),
            retried: self.retried.get(),
            aborted: self.aborted.get(),
            errors: self.errors.get(),
        }
    }
}

/// Lifecycle of the polling workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Durable, retry-bounded processor of outbox events
pub struct OutboxCoordinator {
    store: Arc<dyn OutboxStore>,
    backend: Arc<dyn IndexBackend>,
    tenancy: TenancyPolicy,
    config: OutboxConfig,
    stats: OutboxStats,
    state: Mutex<RunState>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OutboxCoordinator {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        backend: Arc<dyn IndexBackend>,
        tenancy: TenancyPolicy,
        config: OutboxConfig,
    ) -> Result<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            store,
            backend,
            tenancy,
            config,
            stats: OutboxStats::new()?,
            state: Mutex::new(RunState::Idle),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Administration API over the same store and tenancy rules
    pub fn admin(&self) -> AbortedEventAdmin {
        AbortedEventAdmin::new(self.store.clone(), self.tenancy.clone())
    }

    pub fn tenancy(&self) -> &TenancyPolicy {
        &self.tenancy
    }

    pub fn stats(&self) -> OutboxStatsSnapshot {
        self.stats.snapshot()
    }

    /// Prometheus registry of the outbox counters
    pub fn registry(&self) -> &Registry {
        self.stats.registry()
    }

    /// Number of running polling workers
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Durably record a work queue for later application
    pub async fn append(
        &self,
        tenant_id: Option<&str>,
        index_name: &str,
        queue: &WorkQueue,
    ) -> Result<OutboxEvent> {
        let tenant = self.tenancy.resolve(tenant_id)?;
        let payload = queue.encode()?;
        let event = self
            .store
            .append(tenant, index_name, payload, unix_millis())
            .await?;
        self.stats.appended.inc();
        debug!(
            "Outbox: appended event {} for '{}' (tenant={:?}, {} items)",
            event.id,
            index_name,
            tenant,
            queue.len()
        );
        Ok(event)
    }

    /// Return events left in processing by a previous run to pending
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.store.reset_processing().await?;
        if recovered > 0 {
            warn!(
                "Outbox: recovered {} events left in processing by a previous run",
                recovered
            );
        }
        Ok(recovered)
    }

    /// Process one batch of the given tenant over the whole id space
    pub async fn poll_once(&self, tenant_id: Option<&str>) -> Result<BatchOutcome> {
        let tenant = self.tenancy.resolve(tenant_id)?;
        self.process_batch(tenant, Partition::ALL).await
    }

    /// Claim, apply and settle one batch
    async fn process_batch(&self, tenant: Option<&str>, partition: Partition) -> Result<BatchOutcome> {
        let events = self
            .store
            .claim_pending(tenant, partition, self.config.poll_batch_size, unix_millis())
            .await?;
        if events.is_empty() {
            return Ok(BatchOutcome::Idle);
        }

        self.stats.batches.inc();
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();

        match self.execute(&events).await {
            Ok(()) => {
                if let Err(e) = self.store.complete(&ids).await {
                    return Err(self.release_unsettled(&ids, e).await);
                }
                self.stats.applied.inc_by(ids.len() as u64);
                debug!("Outbox: applied events {:?}", ids);
                Ok(BatchOutcome::Applied { events: ids.len() })
            }
            Err(error) => {
                let retry_at = unix_millis() + self.config.retry_delay.as_millis() as u64;
                let outcome = match self
                    .store
                    .fail(&ids, &error, self.config.max_retries, retry_at)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => return Err(self.release_unsettled(&ids, e).await),
                };

                self.stats.retried.inc_by(outcome.retried.len() as u64);
                self.stats.aborted.inc_by(outcome.aborted.len() as u64);

                warn!(
                    "Outbox: batch of {} events failed ({}), rescheduled {:?}",
                    ids.len(),
                    error,
                    outcome.retried
                );
                if !outcome.aborted.is_empty() {
                    error!(
                        "Outbox: events {:?} exhausted {} retries and were aborted",
                        outcome.aborted, self.config.max_retries
                    );
                }
                Ok(BatchOutcome::Failed { error, outcome })
            }
        }
    }

    /// Put a claimed batch back to pending after it could not be settled
    ///
    /// The retry count is left alone; replaying applied work is harmless.
    async fn release_unsettled(&self, ids: &[u64], cause: StoreError) -> OutboxError {
        match self.store.release(ids).await {
            Ok(released) => warn!(
                "Outbox: could not settle events {:?} ({}), released {} back to pending",
                ids, cause, released
            ),
            Err(e) => error!(
                "Outbox: could not settle events {:?} ({}) nor release them ({}); \
                 they stay in processing until the next recovery",
                ids, cause, e
            ),
        }
        cause.into()
    }

    /// Apply every event of a batch; the first failure fails the batch
    async fn execute(&self, events: &[OutboxEvent]) -> std::result::Result<(), String> {
        for event in events {
            let queue = WorkQueue::decode(&event.payload)
                .map_err(|e| format!("event {}: undecodable work queue: {}", event.id, e))?;
            self.backend
                .apply_work_queue(&event.index_name, &queue, event.tenant_id.as_deref())
                .await
                .map_err(|e| format!("event {}: {}", event.id, e))?;
        }
        Ok(())
    }

    /// Recover interrupted events and spawn the polling workers
    ///
    /// Starting a running coordinator is a no-op; a stopped one cannot be
    /// started again.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                RunState::Running => {
                    warn!("Outbox: coordinator already started");
                    return Ok(());
                }
                RunState::Stopped => return Err(OutboxError::Stopped),
                RunState::Idle => *state = RunState::Running,
            }
        }

        if let Err(e) = self.recover().await {
            let mut state = self.state.lock();
            if *state == RunState::Running {
                *state = RunState::Idle;
            }
            return Err(e);
        }

        let partitions = self.config.partitions.max(1);
        {
            let mut workers = self.workers.lock();
            // stop() may have run while recovering
            if *self.state.lock() == RunState::Stopped {
                return Err(OutboxError::Stopped);
            }
            workers.extend((0..partitions).map(|index| {
                let coordinator = self.clone();
                let shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(coordinator.worker_loop(Partition::new(index, partitions), shutdown_rx))
            }));
        }

        info!(
            "Outbox: started {} workers (batch={}, max_retries={}, retry_delay={:?})",
            partitions, self.config.poll_batch_size, self.config.max_retries, self.config.retry_delay
        );
        Ok(())
    }

    /// Let every worker finish its current batch, then wait for it to exit
    pub async fn stop(&self) {
        let workers = {
            let mut workers = self.workers.lock();
            *self.state.lock() = RunState::Stopped;
            self.shutdown_tx.send_replace(true);
            std::mem::take(&mut *workers)
        };
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Outbox: worker ended abnormally: {}", e);
            }
        }

        if let Err(e) = self.store.flush().await {
            error!("Outbox: final flush failed: {}", e);
        }
        info!("Outbox: coordinator stopped");
    }

    async fn worker_loop(self: Arc<Self>, partition: Partition, mut shutdown_rx: watch::Receiver<bool>) {
        debug!("Outbox worker {}/{} running", partition.index, partition.count);
        let scopes = self.tenancy.polling_scopes();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let mut busy = false;
            for scope in &scopes {
                match self.process_batch(scope.as_deref(), partition).await {
                    Ok(BatchOutcome::Idle) => {}
                    Ok(_) => busy = true,
                    Err(e) => {
                        // Store trouble is logged, the loop keeps going
                        self.stats.errors.inc();
                        error!("Outbox worker {}: {}", partition.index, e);
                    }
                }
            }

            if busy {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        debug!("Outbox worker {}/{} exited", partition.index, partition.count);
    }
}
