//! Connector dependencies (using traits for testability)
//!
//! Every collaborator is a trait object so tests can swap in mocks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConnectError;
use crate::scheduler::SyncSlots;
use crate::traits::{BaseConnectionStore, BaseImporter, BaseSiteDiscovery};

/// Deadlines for collaborator calls. Calls are never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub discovery: Duration,
    pub import: Duration,
    pub store: Duration,
}

impl Timeouts {
    /// How long a store-side sync claim is honoured before another worker may
    /// take it over: one import plus the bookkeeping writes around it.
    pub fn claim_window(&self) -> Duration {
        self.import + self.store * 3
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            discovery: Duration::from_secs(30),
            import: Duration::from_secs(600),
            store: Duration::from_secs(10),
        }
    }
}

/// Run `fut` under `limit`.
///
/// The outer `Err` is the deadline; the inner result is the collaborator's own.
pub async fn within<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<anyhow::Result<T>, ConnectError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ConnectError::Timeout {
            operation,
            seconds: limit.as_secs(),
        })
}

#[derive(Clone)]
pub struct ConnectorDeps {
    pub discovery: Arc<dyn BaseSiteDiscovery>,
    pub importer: Arc<dyn BaseImporter>,
    pub store: Arc<dyn BaseConnectionStore>,
    /// Per-role sync slots shared by manual and scheduled triggers
    pub slots: SyncSlots,
    pub timeouts: Timeouts,
}

impl ConnectorDeps {
    pub fn new(
        discovery: Arc<dyn BaseSiteDiscovery>,
        importer: Arc<dyn BaseImporter>,
        store: Arc<dyn BaseConnectionStore>,
    ) -> Self {
        Self {
            discovery,
            importer,
            store,
            slots: SyncSlots::default(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}
