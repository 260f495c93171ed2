//! Aborted event administration.
//!
//! Operator control over events that exhausted their retry budget. Each call
//! reports exactly how many events it affected.

use std::sync::Arc;

use tracing::info;

use super::error::Result;
use super::models::{unix_millis, EventStatus};
use super::store::OutboxStore;
use super::tenancy::TenancyPolicy;

pub struct AbortedEventAdmin {
    store: Arc<dyn OutboxStore>,
    tenancy: TenancyPolicy,
}

impl AbortedEventAdmin {
    pub fn new(store: Arc<dyn OutboxStore>, tenancy: TenancyPolicy) -> Self {
        Self { store, tenancy }
    }

    /// Number of aborted events
    pub async fn count_aborted(&self, tenant_id: Option<&str>) -> Result<usize> {
        let tenant = self.tenancy.resolve(tenant_id)?;
        Ok(self.store.count(tenant, EventStatus::Aborted).await?)
    }

    /// Return aborted events to pending with their retry count reset
    ///
    /// The polling loop picks them up afterwards; nothing is executed here.
    pub async fn reprocess_aborted(&self, tenant_id: Option<&str>) -> Result<usize> {
        let tenant = self.tenancy.resolve(tenant_id)?;
        let count = self.store.reprocess_aborted(tenant, unix_millis()).await?;
        info!(
            "Outbox admin: {} aborted events returned to pending (tenant={:?})",
            count, tenant
        );
        Ok(count)
    }

    /// Permanently delete aborted events
    pub async fn clear_aborted(&self, tenant_id: Option<&str>) -> Result<usize> {
        let tenant = self.tenancy.resolve(tenant_id)?;
        let count = self.store.clear_aborted(tenant).await?;
        info!(
            "Outbox admin: {} aborted events deleted (tenant={:?})",
            count, tenant
        );
        Ok(count)
    }
}
