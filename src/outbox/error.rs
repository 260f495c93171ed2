//! Outbox error types.

use std::fmt;

/// Errors of the durable event store
#[derive(Debug)]
pub enum StoreError {
    /// IO error
    Io(std::io::Error),
    /// Serialization error
    Serialize(String),
    /// Deserialization error
    Deserialize(String),
    /// Storage engine error
    Storage(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Serialize(e) => write!(f, "serialization error: {}", e),
            Self::Deserialize(e) => write!(f, "deserialization error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<fjall::Error> for StoreError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialize(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Deserialize(err.to_string())
    }
}

/// Rejected tenant argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantError {
    /// Tenancy is enabled and no tenant was given
    MissingTenant,
    /// A tenant was given but tenancy is disabled
    TenantNotSupported(String),
    /// The tenant is not configured
    UnknownTenant { tenant_id: String, valid: Vec<String> },
    /// A work queue attributed to one tenant was submitted for another
    QueueTenantMismatch {
        queue_tenant: String,
        tenant_id: Option<String>,
    },
}

impl fmt::Display for TenantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTenant => {
                write!(f, "multi-tenancy is enabled: a tenant identifier is required")
            }
            Self::TenantNotSupported(id) => write!(
                f,
                "multi-tenancy is disabled: tenant identifier '{}' cannot be used",
                id
            ),
            Self::UnknownTenant { tenant_id, valid } => write!(
                f,
                "unknown tenant identifier '{}', valid identifiers are: [{}]",
                tenant_id,
                valid.join(", ")
            ),
            Self::QueueTenantMismatch {
                queue_tenant,
                tenant_id,
            } => match tenant_id {
                Some(id) => write!(
                    f,
                    "work queue of tenant '{}' submitted for tenant '{}'",
                    queue_tenant, id
                ),
                None => write!(
                    f,
                    "work queue of tenant '{}' submitted without a tenant",
                    queue_tenant
                ),
            },
        }
    }
}

impl std::error::Error for TenantError {}

/// Errors surfaced by the outbox coordinator and its administration API
#[derive(Debug)]
pub enum OutboxError {
    Tenant(TenantError),
    Store(StoreError),
    /// Work queue could not be serialized
    Encode(String),
    /// Metrics could not be registered
    Metrics(String),
    /// The coordinator was stopped and cannot be started again
    Stopped,
}

impl fmt::Display for OutboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant(e) => write!(f, "{}", e),
            Self::Store(e) => write!(f, "outbox store: {}", e),
            Self::Encode(e) => write!(f, "work queue encoding: {}", e),
            Self::Metrics(e) => write!(f, "outbox metrics: {}", e),
            Self::Stopped => write!(f, "outbox coordinator stopped"),
        }
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tenant(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Encode(_) | Self::Metrics(_) | Self::Stopped => None,
        }
    }
}

impl From<TenantError> for OutboxError {
    fn from(err: TenantError) -> Self {
        Self::Tenant(err)
    }
}

impl From<StoreError> for OutboxError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<bincode::error::EncodeError> for OutboxError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<prometheus::Error> for OutboxError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}

/// Result type of store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type of outbox operations
pub type Result<T> = std::result::Result<T, OutboxError>;
