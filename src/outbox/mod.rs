//! Outbox module for indexrelay.
//!
//! Durable, retry-bounded processing of indexing work:
//! - Events are appended to a persistent store and polled in batches
//! - A failed batch is rescheduled with an incremented retry count
//! - Events past the retry budget are aborted and left for an operator
//!
//! Uses a trait-based store design:
//! - `FjallOutboxStore` (default) - Local LSM-tree storage
//! - Future: PostgreSQL, etc.

mod admin;
mod coordinator;
mod error;
mod fjall;
mod models;
mod store;
mod tenancy;

pub use admin::AbortedEventAdmin;
pub use coordinator::{OutboxCoordinator, OutboxStats, OutboxStatsSnapshot};
pub use error::{OutboxError, Result, StoreError, StoreResult, TenantError};
pub use fjall::FjallOutboxStore;
pub use models::{unix_millis, BatchOutcome, EventStatus, FailOutcome, OutboxEvent, Partition};
pub use store::OutboxStore;
pub use tenancy::TenancyPolicy;
