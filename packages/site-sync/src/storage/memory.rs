use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::connection::{ConnectionConfig, RoleSyncState};
use crate::id::ConnectionId;
use crate::traits::{BaseConnectionStore, ImportOutcome};
use crate::types::{ExtractionMode, PerRole, Role, SyncInterval};

#[derive(Default)]
struct Inner {
    configs: HashMap<ConnectionId, ConnectionConfig>,
    /// Records the importer reported as synced, per connection and role
    synced_records: HashMap<(ConnectionId, Role), u64>,
    /// Sync claims and when they were taken
    claims: HashMap<(ConnectionId, Role), DateTime<Utc>>,
}

/// In-memory [`BaseConnectionStore`].
///
/// Cloneable; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryConnectionStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of synced records still attributed to this connection/role.
    pub async fn synced_records(&self, connection_id: ConnectionId, role: Role) -> u64 {
        self.inner
            .read()
            .await
            .synced_records
            .get(&(connection_id, role))
            .copied()
            .unwrap_or_default()
    }

    async fn update<F>(&self, connection_id: ConnectionId, f: F) -> Result<()>
    where
        F: FnOnce(&mut ConnectionConfig) + Send,
    {
        let mut inner = self.inner.write().await;
        let config = inner
            .configs
            .get_mut(&connection_id)
            .ok_or_else(|| anyhow!("connection {} not found", connection_id))?;
        f(config);
        Ok(())
    }
}

#[async_trait]
impl BaseConnectionStore for InMemoryConnectionStore {
    async fn load(&self, connection_id: ConnectionId) -> Result<Option<ConnectionConfig>> {
        Ok(self.inner.read().await.configs.get(&connection_id).cloned())
    }

    async fn save(&self, config: &ConnectionConfig) -> Result<()> {
        self.inner
            .write()
            .await
            .configs
            .insert(config.connection_id, config.clone());
        Ok(())
    }

    async fn delete(&self, connection_id: ConnectionId, cascade: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.configs.remove(&connection_id);
        inner.claims.retain(|(id, _), _| *id != connection_id);
        if cascade {
            inner.synced_records.retain(|(id, _), _| *id != connection_id);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConnectionConfig>> {
        let mut configs: Vec<_> = self.inner.read().await.configs.values().cloned().collect();
        configs.sort_by_key(|c| c.connection_id);
        Ok(configs)
    }

    async fn remap(
        &self,
        connection_id: ConnectionId,
        site_url: &str,
        endpoints: &PerRole<Option<String>>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(config) = inner.configs.get_mut(&connection_id) else {
            return Ok(false);
        };

        let same_site = config.site_url == site_url;
        for role in Role::ALL {
            if !same_site || config.endpoints[role] != endpoints[role] {
                config.sync[role] = RoleSyncState::default();
            }
        }
        config.site_url = site_url.to_string();
        config.endpoints = endpoints.clone();
        Ok(true)
    }

    async fn update_mapping(
        &self,
        connection_id: ConnectionId,
        endpoints: &PerRole<Option<String>>,
        extraction_mode: ExtractionMode,
    ) -> Result<()> {
        let endpoints = endpoints.clone();
        self.update(connection_id, move |config| {
            config.endpoints = endpoints;
            config.extraction_mode = extraction_mode;
        })
        .await
    }

    async fn update_interval(
        &self,
        connection_id: ConnectionId,
        role: Role,
        interval: SyncInterval,
    ) -> Result<()> {
        self.update(connection_id, move |config| config.intervals[role] = interval)
            .await
    }

    async fn record_sync(
        &self,
        connection_id: ConnectionId,
        role: Role,
        outcome: &ImportOutcome,
    ) -> Result<()> {
        let ImportOutcome {
            item_count,
            last_sync,
        } = *outcome;
        self.update(connection_id, move |config| {
            let state = &mut config.sync[role];
            state.last_sync = Some(last_sync);
            state.count = item_count;
            state.last_error = None;
        })
        .await?;

        self.inner
            .write()
            .await
            .synced_records
            .insert((connection_id, role), item_count);
        Ok(())
    }

    async fn record_sync_failure(
        &self,
        connection_id: ConnectionId,
        role: Role,
        error: &str,
    ) -> Result<()> {
        let error = error.to_string();
        self.update(connection_id, move |config| {
            config.sync[role].last_error = Some(error);
        })
        .await
    }

    async fn try_claim_sync(
        &self,
        connection_id: ConnectionId,
        role: Role,
        stale_after: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(stale_after)?;
        let mut inner = self.inner.write().await;
        if !inner.configs.contains_key(&connection_id) {
            return Ok(false);
        }

        let held = inner
            .claims
            .get(&(connection_id, role))
            .is_some_and(|claimed_at| now - *claimed_at < stale_after);
        if held {
            return Ok(false);
        }
        inner.claims.insert((connection_id, role), now);
        Ok(true)
    }

    async fn release_sync(&self, connection_id: ConnectionId, role: Role) -> Result<()> {
        self.inner.write().await.claims.remove(&(connection_id, role));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(ConnectionId::new(), "https://example.org")
            .with_endpoint(Role::Community, Some("/community"))
            .with_endpoint(Role::Property, Some("/listing"))
    }

    #[tokio::test]
    async fn field_groups_do_not_clobber_each_other() {
        let store = InMemoryConnectionStore::new();
        let config = config();
        let id = config.connection_id;
        store.save(&config).await.unwrap();

        let endpoints = PerRole::new(Some("/places".to_string()), Some("/listing".to_string()));
        store
            .update_mapping(id, &endpoints, ExtractionMode::Ai)
            .await
            .unwrap();
        store
            .record_sync(
                id,
                Role::Community,
                &ImportOutcome {
                    item_count: 7,
                    last_sync: Utc::now(),
                },
            )
            .await
            .unwrap();
        store
            .update_interval(id, Role::Property, SyncInterval::Hourly6)
            .await
            .unwrap();

        let saved = store.load(id).await.unwrap().unwrap();
        assert_eq!(saved.endpoint(Role::Community), Some("/places"));
        assert_eq!(saved.extraction_mode, ExtractionMode::Ai);
        assert_eq!(saved.count(Role::Community), 7);
        assert_eq!(saved.interval(Role::Property), SyncInterval::Hourly6);
    }

    #[tokio::test]
    async fn failure_is_cleared_by_next_success() {
        let store = InMemoryConnectionStore::new();
        let config = config();
        let id = config.connection_id;
        store.save(&config).await.unwrap();

        store
            .record_sync_failure(id, Role::Property, "timeout")
            .await
            .unwrap();
        assert_eq!(
            store.load(id).await.unwrap().unwrap().sync[Role::Property].last_error.as_deref(),
            Some("timeout")
        );

        store
            .record_sync(
                id,
                Role::Property,
                &ImportOutcome {
                    item_count: 3,
                    last_sync: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(store.load(id).await.unwrap().unwrap().sync[Role::Property].last_error.is_none());
    }

    #[tokio::test]
    async fn cascade_delete_drops_synced_records() {
        let store = InMemoryConnectionStore::new();
        let config = config();
        let id = config.connection_id;
        store.save(&config).await.unwrap();
        store
            .record_sync(
                id,
                Role::Community,
                &ImportOutcome {
                    item_count: 5,
                    last_sync: Utc::now(),
                },
            )
            .await
            .unwrap();

        store.delete(id, false).await.unwrap();
        assert_eq!(store.synced_records(id, Role::Community).await, 5);

        store.save(&config).await.unwrap();
        store.delete(id, true).await.unwrap();
        assert_eq!(store.synced_records(id, Role::Community).await, 0);
        assert!(store.load(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remap_resets_only_changed_roles() {
        let store = InMemoryConnectionStore::new();
        let config = config().with_interval(Role::Property, SyncInterval::Hourly2);
        let id = config.connection_id;
        store.save(&config).await.unwrap();
        for role in Role::ALL {
            store
                .record_sync(
                    id,
                    role,
                    &ImportOutcome {
                        item_count: 8,
                        last_sync: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let endpoints = PerRole::new(Some("/community".to_string()), Some("/homes".to_string()));
        assert!(store.remap(id, "https://example.org", &endpoints).await.unwrap());

        let saved = store.load(id).await.unwrap().unwrap();
        assert_eq!(saved.count(Role::Community), 8);
        assert!(saved.last_sync(Role::Community).is_some());
        assert_eq!(saved.count(Role::Property), 0);
        assert!(saved.last_sync(Role::Property).is_none());
        assert_eq!(saved.interval(Role::Property), SyncInterval::Hourly2);

        // new site: everything resets, schedule stays
        assert!(store.remap(id, "https://other.example.org", &endpoints).await.unwrap());
        let saved = store.load(id).await.unwrap().unwrap();
        assert_eq!(saved.count(Role::Community), 0);
        assert_eq!(saved.interval(Role::Property), SyncInterval::Hourly2);

        assert!(!store
            .remap(ConnectionId::new(), "https://example.org", &endpoints)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn sync_claims_are_exclusive_until_released_or_stale() {
        let store = InMemoryConnectionStore::new();
        let config = config();
        let id = config.connection_id;
        let hour = Duration::from_secs(3600);
        assert!(!store.try_claim_sync(id, Role::Community, hour).await.unwrap());
        store.save(&config).await.unwrap();

        assert!(store.try_claim_sync(id, Role::Community, hour).await.unwrap());
        assert!(!store.try_claim_sync(id, Role::Community, hour).await.unwrap());
        assert!(store.try_claim_sync(id, Role::Property, hour).await.unwrap());

        store.release_sync(id, Role::Community).await.unwrap();
        assert!(store.try_claim_sync(id, Role::Community, hour).await.unwrap());

        // an abandoned claim expires
        assert!(store
            .try_claim_sync(id, Role::Community, Duration::ZERO)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn group_write_on_missing_connection_fails() {
        let store = InMemoryConnectionStore::new();
        let result = store
            .update_interval(ConnectionId::new(), Role::Community, SyncInterval::Daily)
            .await;
        assert!(result.is_err());
    }
}
