//! Outbox and tenancy configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::outbox::TenancyPolicy;

/// Outbox configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Run the polling processor on this node
    pub enabled: bool,

    /// Data directory path (for fjall)
    pub path: PathBuf,

    /// Pause between polls when no event is ready (e.g., "1s")
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum events claimed per batch
    pub poll_batch_size: usize,

    /// Failed attempts tolerated before an event is aborted
    pub max_retries: u32,

    /// Delay before a failed batch becomes claimable again
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Number of polling workers, each owning a disjoint slice of event ids
    pub partitions: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/outbox"),
            poll_interval: Duration::from_secs(1),
            poll_batch_size: 50,
            max_retries: 3,
            retry_delay: Duration::from_secs(10),
            partitions: 1,
        }
    }
}

/// Multi-tenancy configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TenancyConfig {
    /// Scope every outbox operation by tenant
    pub enabled: bool,

    /// Known tenant identifiers
    pub tenant_ids: Vec<String>,
}

impl TenancyConfig {
    pub fn policy(&self) -> TenancyPolicy {
        if self.enabled {
            TenancyPolicy::enabled(self.tenant_ids.iter().cloned())
        } else {
            TenancyPolicy::disabled()
        }
    }
}
