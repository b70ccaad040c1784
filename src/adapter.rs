//! The common surface every ingestion source implements (spec.md §4.6).

use crate::entity::Entity;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Clone, Debug)]
pub struct Health {
    pub status: HealthStatus,
    pub message: String,
    pub last_successful_read: Option<DateTime<Utc>>,
}

impl Health {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            message: message.into(),
            last_successful_read: None,
        }
    }
}

/// A recovery request in flight. Dropping it does not cancel the underlying
/// download; callers that want cancellation should `abort()` explicitly.
pub struct RecoveryHandle {
    handle: JoinHandle<()>,
}

impl RecoveryHandle {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Common surface every ingestion source implements. Adapters own their I/O
/// threads; `start`/`stop` are called exactly once each by the host.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;
    fn display_name(&self) -> &str;
    fn version(&self) -> &str;

    /// Called once at startup to populate the entity registry.
    fn provided_entities(&self) -> Vec<Entity>;

    async fn health(&self) -> Health;

    fn supports_recovery(&self) -> bool {
        false
    }

    /// `to` is accepted for API symmetry but unused by adapters whose
    /// underlying protocol only supports "everything after `from`"; treat it
    /// as advisory.
    fn request_recovery(
        &self,
        _from: DateTime<Utc>,
        _to: Option<DateTime<Utc>>,
    ) -> Option<RecoveryHandle> {
        None
    }

    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self);
}
