use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ConnectionId;
use crate::types::{ExtractionMode, PerRole, Role, SyncInterval};

/// Last-sync bookkeeping for one role.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoleSyncState {
    pub last_sync: Option<DateTime<Utc>>,
    pub count: u64,
    /// Most recent failure, cleared by the next successful sync
    pub last_error: Option<String>,
}

/// Persisted connection between an agent and a remote site.
///
/// Writes are split into three field groups so concurrent writers don't
/// clobber each other:
/// - mapping: `site_url`, `endpoints`, `extraction_mode`
/// - schedule: `intervals`
/// - sync: `sync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub connection_id: ConnectionId,
    pub site_url: String,
    /// `rest_base` per role; `None` means "don't sync"
    pub endpoints: PerRole<Option<String>>,
    pub extraction_mode: ExtractionMode,
    pub intervals: PerRole<SyncInterval>,
    pub sync: PerRole<RoleSyncState>,
}

impl ConnectionConfig {
    pub fn new(connection_id: ConnectionId, site_url: impl Into<String>) -> Self {
        Self {
            connection_id,
            site_url: site_url.into(),
            endpoints: PerRole::default(),
            extraction_mode: ExtractionMode::default(),
            intervals: PerRole::default(),
            sync: PerRole::default(),
        }
    }

    pub fn with_endpoint(mut self, role: Role, rest_base: Option<impl Into<String>>) -> Self {
        self.endpoints[role] = rest_base.map(Into::into);
        self
    }

    pub fn with_interval(mut self, role: Role, interval: SyncInterval) -> Self {
        self.intervals[role] = interval;
        self
    }

    pub fn endpoint(&self, role: Role) -> Option<&str> {
        self.endpoints[role].as_deref()
    }

    pub fn interval(&self, role: Role) -> SyncInterval {
        self.intervals[role]
    }

    pub fn last_sync(&self, role: Role) -> Option<DateTime<Utc>> {
        self.sync[role].last_sync
    }

    pub fn count(&self, role: Role) -> u64 {
        self.sync[role].count
    }

    /// Same non-null endpoint mapped to both roles.
    pub fn has_role_conflict(&self) -> bool {
        matches!(
            (self.endpoint(Role::Community), self.endpoint(Role::Property)),
            (Some(community), Some(property)) if community == property
        )
    }

    /// Mapping produced by a fresh confirmation, carrying over what the
    /// previous config for this connection already knew.
    ///
    /// Intervals and extraction mode always carry over. Sync bookkeeping only
    /// carries over for roles still pointing at the same site and endpoint.
    pub fn reconfirmed(
        connection_id: ConnectionId,
        site_url: &str,
        endpoints: PerRole<Option<String>>,
        prior: Option<&ConnectionConfig>,
    ) -> Self {
        let mut config = ConnectionConfig::new(connection_id, site_url);
        config.endpoints = endpoints;

        if let Some(prior) = prior {
            config.intervals = prior.intervals;
            config.extraction_mode = prior.extraction_mode;
            if prior.site_url == site_url {
                for role in Role::ALL {
                    if prior.endpoints[role] == config.endpoints[role] {
                        config.sync[role] = prior.sync[role].clone();
                    }
                }
            }
        }

        config
    }
}
