//! Sync scheduling and execution.
//!
//! ```text
//! Scheduler (SYNC_CRON, every minute by default)
//!     │
//!     └─► run_due_syncs()
//!             └─► For each connection, each due role → SyncRunner::run_role()
//!                     └─► importer.import_role() → store.record_sync()
//! ```
//!
//! Manual triggers go through the same [`SyncRunner`], so both share the
//! per-role [`SyncSlots`]: a second sync of a role that is already running is
//! rejected instead of interleaving with the first. Slots only cover this
//! process; a run also claims the role through the store so workers sharing
//! a database serialize too.

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::connection::ConnectionConfig;
use crate::deps::{within, ConnectorDeps};
use crate::error::{ConnectError, Result};
use crate::id::ConnectionId;
use crate::traits::{ImportOutcome, ImportRequest};
use crate::types::{Role, SyncInterval};

// ============================================================================
// DUE CALCULATION / DISPLAY
// ============================================================================

/// `manual` is never due; a role that never synced is due immediately.
pub fn is_due(interval: SyncInterval, last_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let Some(period) = interval.period() else {
        return false;
    };
    match last_sync {
        None => true,
        Some(last) => last + period <= now,
    }
}

/// When the role will next be due, `None` for manual roles.
pub fn next_due(interval: SyncInterval, last_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let period = interval.period()?;
    Some(last_sync.map_or(now, |last| last + period))
}

/// Roles of `config` that have an endpoint and are due at `now`.
pub fn due_roles(config: &ConnectionConfig, now: DateTime<Utc>) -> Vec<Role> {
    Role::ALL
        .into_iter()
        .filter(|role| config.endpoint(*role).is_some())
        .filter(|role| is_due(config.interval(*role), config.last_sync(*role), now))
        .collect()
}

/// Short relative label for a last-sync timestamp.
pub fn format_last_sync(last_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(last) = last_sync else {
        return "Never".to_string();
    };

    let elapsed = now - last;
    if elapsed.num_minutes() < 1 {
        "Just now".to_string()
    } else if elapsed.num_minutes() < 60 {
        format!("{}m ago", elapsed.num_minutes())
    } else if elapsed.num_hours() < 24 {
        format!("{}h ago", elapsed.num_hours())
    } else {
        format!("{}d ago", elapsed.num_days())
    }
}

// ============================================================================
// SYNC SLOTS
// ============================================================================

type SlotKey = (ConnectionId, Role);

/// Running syncs, one slot per connection and role.
#[derive(Debug, Clone, Default)]
pub struct SyncSlots {
    running: Arc<DashSet<SlotKey>>,
}

impl SyncSlots {
    /// Claim the slot, `None` if a sync for this role is already running.
    pub fn try_acquire(&self, connection_id: ConnectionId, role: Role) -> Option<SyncSlotGuard> {
        let key = (connection_id, role);
        self.running.insert(key).then(|| SyncSlotGuard {
            running: self.running.clone(),
            key,
        })
    }

    pub fn is_running(&self, connection_id: ConnectionId, role: Role) -> bool {
        self.running.contains(&(connection_id, role))
    }
}

/// Releases the slot on drop, including when the sync future is cancelled.
#[derive(Debug)]
pub struct SyncSlotGuard {
    running: Arc<DashSet<SlotKey>>,
    key: SlotKey,
}

impl Drop for SyncSlotGuard {
    fn drop(&mut self) {
        self.running.remove(&self.key);
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Runs quick syncs and full resyncs for one role at a time.
#[derive(Clone)]
pub struct SyncRunner {
    deps: ConnectorDeps,
}

impl SyncRunner {
    pub fn new(deps: ConnectorDeps) -> Self {
        Self { deps }
    }

    pub fn is_running(&self, connection_id: ConnectionId, role: Role) -> bool {
        self.deps.slots.is_running(connection_id, role)
    }

    /// Sync one role of one connection.
    ///
    /// `full` drops and re-imports everything; otherwise only new or changed
    /// items are fetched. Failures are recorded against this role only.
    pub async fn run_role(&self, connection_id: ConnectionId, role: Role, full: bool) -> Result<ImportOutcome> {
        let _slot = self
            .deps
            .slots
            .try_acquire(connection_id, role)
            .ok_or(ConnectError::SyncInProgress { role })?;

        let timeouts = self.deps.timeouts;
        let config = within(
            "loading the connection",
            timeouts.store,
            self.deps.store.load(connection_id),
        )
        .await?
        .map_err(ConnectError::storage)?
        .ok_or(ConnectError::NotConnected)?;

        let endpoint = config
            .endpoint(role)
            .ok_or(ConnectError::SyncDisabled { role })?
            .to_string();

        let claimed = within(
            "claiming the sync",
            timeouts.store,
            self.deps.store.try_claim_sync(connection_id, role, timeouts.claim_window()),
        )
        .await?
        .map_err(ConnectError::storage)?;
        if !claimed {
            tracing::debug!(%connection_id, %role, "Role already syncing in another process");
            return Err(ConnectError::SyncInProgress { role });
        }

        let request = ImportRequest {
            connection_id,
            site_url: config.site_url.clone(),
            role,
            endpoint,
            extraction_mode: config.extraction_mode,
            full,
        };

        // If this future is dropped mid-sync the claim stays until it goes stale.
        let result = self.import_and_record(request).await;

        match within(
            "releasing the sync",
            timeouts.store,
            self.deps.store.release_sync(connection_id, role),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(%connection_id, %role, "Could not release sync claim: {}", e),
            Err(e) => tracing::warn!(%connection_id, %role, "Could not release sync claim: {}", e),
        }

        result
    }

    async fn import_and_record(&self, request: ImportRequest) -> Result<ImportOutcome> {
        let timeouts = self.deps.timeouts;
        let connection_id = request.connection_id;
        let role = request.role;
        let full = request.full;

        tracing::info!(
            %connection_id,
            %role,
            endpoint = %request.endpoint,
            full,
            "Starting {} sync",
            if full { "full" } else { "quick" }
        );

        let error = match within("import", timeouts.import, self.deps.importer.import_role(request)).await {
            Ok(Ok(outcome)) => {
                within(
                    "recording the sync",
                    timeouts.store,
                    self.deps.store.record_sync(connection_id, role, &outcome),
                )
                .await?
                .map_err(ConnectError::storage)?;

                tracing::info!(
                    %connection_id,
                    %role,
                    items = outcome.item_count,
                    "Sync complete"
                );
                return Ok(outcome);
            }
            Ok(Err(e)) => ConnectError::SyncFailed {
                role,
                reason: e.to_string(),
            },
            Err(timeout) => timeout,
        };

        let reason = match &error {
            ConnectError::SyncFailed { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        tracing::warn!(%connection_id, %role, "Sync failed: {}", reason);

        match within(
            "recording the sync failure",
            timeouts.store,
            self.deps.store.record_sync_failure(connection_id, role, &reason),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(%connection_id, %role, "Could not record sync failure: {}", e),
            Err(e) => tracing::warn!(%connection_id, %role, "Could not record sync failure: {}", e),
        }

        Err(error)
    }

    /// Run every due role across all connections, concurrently.
    ///
    /// Returns the number of syncs that completed. Individual failures are
    /// logged and recorded, not returned.
    pub async fn run_due_syncs(&self, now: DateTime<Utc>) -> Result<usize> {
        let configs = within("listing connections", self.deps.timeouts.store, self.deps.store.list())
            .await?
            .map_err(ConnectError::storage)?;

        let due: Vec<(ConnectionId, Role)> = configs
            .iter()
            .flat_map(|config| {
                due_roles(config, now)
                    .into_iter()
                    .map(move |role| (config.connection_id, role))
            })
            .filter(|(connection_id, role)| !self.is_running(*connection_id, *role))
            .collect();

        if due.is_empty() {
            tracing::debug!("No roles due for sync");
            return Ok(0);
        }

        tracing::info!("Found {} roles due for sync", due.len());

        let results = futures::future::join_all(
            due.iter()
                .map(|(connection_id, role)| self.run_role(*connection_id, *role, false)),
        )
        .await;

        let mut completed = 0;
        for ((connection_id, role), result) in due.into_iter().zip(results) {
            match result {
                Ok(_) => completed += 1,
                // picked up by a manual trigger or another worker in the meantime
                Err(ConnectError::SyncInProgress { .. }) => {
                    tracing::debug!(%connection_id, %role, "Skipping role already syncing")
                }
                Err(e) => tracing::error!(%connection_id, %role, "Scheduled sync failed: {}", e),
            }
        }

        Ok(completed)
    }
}

/// Start the background driver that runs due syncs on `cron`.
pub async fn start_scheduler(runner: SyncRunner, cron: &str) -> AnyResult<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let sync_job = Job::new_async(cron, move |_uuid, _lock| {
        let runner = runner.clone();
        Box::pin(async move {
            if let Err(e) = runner.run_due_syncs(Utc::now()).await {
                tracing::error!("Due-sync task failed: {}", e);
            }
        })
    })?;

    scheduler.add(sync_job).await?;
    scheduler.start().await?;

    tracing::info!("Sync scheduler started ({})", cron);
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn manual_is_never_due() {
        assert!(!is_due(SyncInterval::Manual, None, now()));
        assert!(!is_due(SyncInterval::Manual, Some(now() - Duration::days(30)), now()));
        assert_eq!(next_due(SyncInterval::Manual, None, now()), None);
    }

    #[test]
    fn never_synced_is_due_immediately() {
        assert!(is_due(SyncInterval::Daily, None, now()));
        assert_eq!(next_due(SyncInterval::Daily, None, now()), Some(now()));
    }

    #[test]
    fn due_after_one_interval() {
        let last = now() - Duration::hours(4);
        assert!(is_due(SyncInterval::Hourly4, Some(last), now()));
        assert!(!is_due(SyncInterval::Hourly6, Some(last), now()));
        assert_eq!(
            next_due(SyncInterval::Hourly6, Some(last), now()),
            Some(now() + Duration::hours(2))
        );
    }

    #[test]
    fn roles_without_endpoint_are_never_due() {
        let config = ConnectionConfig::new(ConnectionId::new(), "https://example.org")
            .with_endpoint(Role::Community, Some("/community"))
            .with_endpoint(Role::Property, None::<String>);
        assert_eq!(due_roles(&config, now()), vec![Role::Community]);

        let manual = config.with_interval(Role::Community, SyncInterval::Manual);
        assert!(due_roles(&manual, now()).is_empty());
    }

    #[test]
    fn last_sync_labels() {
        let label = |ago: Duration| format_last_sync(Some(now() - ago), now());
        assert_eq!(format_last_sync(None, now()), "Never");
        assert_eq!(label(Duration::seconds(59)), "Just now");
        assert_eq!(label(Duration::minutes(1)), "1m ago");
        assert_eq!(label(Duration::minutes(59)), "59m ago");
        assert_eq!(label(Duration::minutes(60)), "1h ago");
        assert_eq!(label(Duration::hours(23)), "23h ago");
        assert_eq!(label(Duration::hours(24)), "1d ago");
        assert_eq!(label(Duration::days(9)), "9d ago");
    }

    #[test]
    fn slots_are_per_role_and_released_on_drop() {
        let slots = SyncSlots::default();
        let id = ConnectionId::new();

        let guard = slots.try_acquire(id, Role::Community).unwrap();
        assert!(slots.try_acquire(id, Role::Community).is_none());
        assert!(slots.try_acquire(id, Role::Property).is_some());
        assert!(slots.is_running(id, Role::Community));

        drop(guard);
        assert!(!slots.is_running(id, Role::Community));
        assert!(slots.try_acquire(id, Role::Community).is_some());
    }
}
