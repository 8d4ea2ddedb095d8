// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Classification, mapping and scheduling decisions live in the domain modules
// and only reach the outside world through these seams.
//
// Naming convention: Base* for trait names (e.g., BaseSiteDiscovery, BaseImporter)

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::endpoints::DiscoveredEndpointSet;
use crate::id::ConnectionId;
use crate::types::{ExtractionMode, PerRole, Role, SyncInterval};

// =============================================================================
// Discovery Collaborator (inspects a remote site's REST API)
// =============================================================================

#[async_trait]
pub trait BaseSiteDiscovery: Send + Sync {
    /// Cheap reachability check run before discovery.
    ///
    /// Default: assume reachable and let `discover` report failures.
    async fn probe(&self, site_url: &str) -> Result<()> {
        let _ = site_url;
        Ok(())
    }

    /// Return every custom content type the site exposes, pre-classified.
    ///
    /// An empty set means the site is reachable but has nothing to map.
    async fn discover(&self, site_url: &str) -> Result<DiscoveredEndpointSet>;
}

// =============================================================================
// Import Collaborator (turns remote posts into Community/Property records)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub connection_id: ConnectionId,
    pub site_url: String,
    pub role: Role,
    pub endpoint: String,
    pub extraction_mode: ExtractionMode,
    /// Drop and re-import everything instead of fetching new/changed items
    pub full: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub item_count: u64,
    pub last_sync: DateTime<Utc>,
}

#[async_trait]
pub trait BaseImporter: Send + Sync {
    async fn import_role(&self, request: ImportRequest) -> Result<ImportOutcome>;
}

// =============================================================================
// Connection Store (persistence)
// =============================================================================

/// Persistence for [`ConnectionConfig`].
///
/// Besides whole-config save/delete, each field group has its own write so
/// a finishing sync can't overwrite a concurrent endpoint edit (and vice
/// versa). Group writes on a missing connection are errors.
#[async_trait]
pub trait BaseConnectionStore: Send + Sync {
    async fn load(&self, connection_id: ConnectionId) -> Result<Option<ConnectionConfig>>;

    /// Insert or replace the whole config (mapping confirmation).
    async fn save(&self, config: &ConnectionConfig) -> Result<()>;

    /// Delete the config; with `cascade`, also every record synced through it.
    async fn delete(&self, connection_id: ConnectionId, cascade: bool) -> Result<()>;

    /// Every saved connection (scheduler driver).
    async fn list(&self) -> Result<Vec<ConnectionConfig>>;

    // Mapping group

    /// Point an existing connection at `site_url` / `endpoints`.
    ///
    /// Compared against the stored row: a role's sync group is reset only
    /// when the site URL or that role's endpoint changed. Intervals and
    /// extraction mode are left alone. `Ok(false)` when no row exists.
    async fn remap(
        &self,
        connection_id: ConnectionId,
        site_url: &str,
        endpoints: &PerRole<Option<String>>,
    ) -> Result<bool>;

    async fn update_mapping(
        &self,
        connection_id: ConnectionId,
        endpoints: &PerRole<Option<String>>,
        extraction_mode: ExtractionMode,
    ) -> Result<()>;

    // Schedule group
    async fn update_interval(
        &self,
        connection_id: ConnectionId,
        role: Role,
        interval: SyncInterval,
    ) -> Result<()>;

    // Sync group
    async fn record_sync(
        &self,
        connection_id: ConnectionId,
        role: Role,
        outcome: &ImportOutcome,
    ) -> Result<()>;

    async fn record_sync_failure(
        &self,
        connection_id: ConnectionId,
        role: Role,
        error: &str,
    ) -> Result<()>;

    /// Claim the right to import `role`, shared by every process using this
    /// store. `Ok(false)` while another claim younger than `stale_after` is
    /// held, or when the connection does not exist.
    async fn try_claim_sync(
        &self,
        connection_id: ConnectionId,
        role: Role,
        stale_after: Duration,
    ) -> Result<bool>;

    async fn release_sync(&self, connection_id: ConnectionId, role: Role) -> Result<()>;
}
