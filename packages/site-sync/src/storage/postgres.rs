use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::connection::{ConnectionConfig, RoleSyncState};
use crate::id::ConnectionId;
use crate::traits::{BaseConnectionStore, ImportOutcome};
use crate::types::{ExtractionMode, PerRole, Role, SyncInterval};

const SELECT_COLUMNS: &str = r#"
    id, site_url,
    community_endpoint, property_endpoint, extraction_mode,
    community_interval, property_interval,
    community_last_sync, community_count, community_last_error,
    property_last_sync, property_count, property_last_error
"#;

/// Table the importer writes synced records for `role` into.
fn synced_table(role: Role) -> &'static str {
    match role {
        Role::Community => "synced_communities",
        Role::Property => "synced_properties",
    }
}

fn config_from_row(r: &PgRow) -> Result<ConnectionConfig> {
    let interval = |role: Role| -> Result<SyncInterval> {
        let raw: String = r.get(format!("{}_interval", role).as_str());
        raw.parse().map_err(|e: String| anyhow!(e))
    };
    let sync = |role: Role| -> Result<RoleSyncState> {
        let count: i64 = r.get(format!("{}_count", role).as_str());
        Ok(RoleSyncState {
            last_sync: r.get(format!("{}_last_sync", role).as_str()),
            count: u64::try_from(count)
                .with_context(|| format!("Negative {} count {}", role, count))?,
            last_error: r.get(format!("{}_last_error", role).as_str()),
        })
    };

    let extraction_mode: String = r.get("extraction_mode");

    Ok(ConnectionConfig {
        connection_id: r.get("id"),
        site_url: r.get("site_url"),
        endpoints: PerRole::new(r.get("community_endpoint"), r.get("property_endpoint")),
        extraction_mode: extraction_mode.parse().map_err(|e: String| anyhow!(e))?,
        intervals: PerRole::new(interval(Role::Community)?, interval(Role::Property)?),
        sync: PerRole::new(sync(Role::Community)?, sync(Role::Property)?),
    })
}

/// Counts are BIGINT columns.
fn count_column(count: u64) -> Result<i64> {
    i64::try_from(count).with_context(|| format!("Sync count {} does not fit in BIGINT", count))
}

/// PostgreSQL implementation of [`BaseConnectionStore`].
pub struct PostgresConnectionStore {
    pool: PgPool,
}

impl PostgresConnectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn ensure_updated(rows: u64, connection_id: ConnectionId) -> Result<()> {
        if rows == 0 {
            return Err(anyhow!("connection {} not found", connection_id));
        }
        Ok(())
    }
}

#[async_trait]
impl BaseConnectionStore for PostgresConnectionStore {
    async fn load(&self, connection_id: ConnectionId) -> Result<Option<ConnectionConfig>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM site_connections WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load site connection")?;

        row.as_ref().map(config_from_row).transpose()
    }

    async fn save(&self, config: &ConnectionConfig) -> Result<()> {
        let community = &config.sync[Role::Community];
        let property = &config.sync[Role::Property];
        let community_count = count_column(community.count)?;
        let property_count = count_column(property.count)?;

        sqlx::query(
            r#"
            INSERT INTO site_connections (
                id, site_url,
                community_endpoint, property_endpoint, extraction_mode,
                community_interval, property_interval,
                community_last_sync, community_count, community_last_error,
                property_last_sync, property_count, property_last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                site_url = EXCLUDED.site_url,
                community_endpoint = EXCLUDED.community_endpoint,
                property_endpoint = EXCLUDED.property_endpoint,
                extraction_mode = EXCLUDED.extraction_mode,
                community_interval = EXCLUDED.community_interval,
                property_interval = EXCLUDED.property_interval,
                community_last_sync = EXCLUDED.community_last_sync,
                community_count = EXCLUDED.community_count,
                community_last_error = EXCLUDED.community_last_error,
                property_last_sync = EXCLUDED.property_last_sync,
                property_count = EXCLUDED.property_count,
                property_last_error = EXCLUDED.property_last_error,
                updated_at = NOW()
            "#,
        )
        .bind(config.connection_id)
        .bind(&config.site_url)
        .bind(config.endpoint(Role::Community))
        .bind(config.endpoint(Role::Property))
        .bind(config.extraction_mode.as_str())
        .bind(config.interval(Role::Community).as_str())
        .bind(config.interval(Role::Property).as_str())
        .bind(community.last_sync)
        .bind(community_count)
        .bind(&community.last_error)
        .bind(property.last_sync)
        .bind(property_count)
        .bind(&property.last_error)
        .execute(&self.pool)
        .await
        .context("Failed to save site connection")?;
        Ok(())
    }

    async fn delete(&self, connection_id: ConnectionId, cascade: bool) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if cascade {
            for role in Role::ALL {
                let deleted = sqlx::query(&format!(
                    "DELETE FROM {} WHERE connection_id = $1",
                    synced_table(role)
                ))
                .bind(connection_id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to delete synced {} records", role))?
                .rows_affected();
                tracing::info!(%connection_id, %role, deleted, "Deleted synced records");
            }
        }

        sqlx::query("DELETE FROM site_connections WHERE id = $1")
            .bind(connection_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete site connection")?;

        tx.commit().await.context("Failed to commit disconnect")?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConnectionConfig>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM site_connections ORDER BY id",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list site connections")?;

        rows.iter().map(config_from_row).collect()
    }

    async fn remap(
        &self,
        connection_id: ConnectionId,
        site_url: &str,
        endpoints: &PerRole<Option<String>>,
    ) -> Result<bool> {
        // Bookkeeping survives only for roles still reading the same feed.
        let keep = |role: Role, param: &str| {
            format!(
                "site_url = $2 AND {}_endpoint IS NOT DISTINCT FROM {}",
                role, param
            )
        };
        let sync_group = |role: Role, param: &str| {
            let keep = keep(role, param);
            format!(
                "{role}_last_sync = CASE WHEN {keep} THEN {role}_last_sync END,
                {role}_count = CASE WHEN {keep} THEN {role}_count ELSE 0 END,
                {role}_last_error = CASE WHEN {keep} THEN {role}_last_error END",
                role = role,
                keep = keep
            )
        };

        let rows = sqlx::query(&format!(
            r#"
            UPDATE site_connections
            SET {},
                {},
                site_url = $2,
                community_endpoint = $3,
                property_endpoint = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
            sync_group(Role::Community, "$3"),
            sync_group(Role::Property, "$4"),
        ))
        .bind(connection_id)
        .bind(site_url)
        .bind(endpoints[Role::Community].as_deref())
        .bind(endpoints[Role::Property].as_deref())
        .execute(&self.pool)
        .await
        .context("Failed to remap site connection")?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn update_mapping(
        &self,
        connection_id: ConnectionId,
        endpoints: &PerRole<Option<String>>,
        extraction_mode: ExtractionMode,
    ) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE site_connections
            SET community_endpoint = $2,
                property_endpoint = $3,
                extraction_mode = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(connection_id)
        .bind(endpoints[Role::Community].as_deref())
        .bind(endpoints[Role::Property].as_deref())
        .bind(extraction_mode.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update endpoint mapping")?
        .rows_affected();

        Self::ensure_updated(rows, connection_id)
    }

    async fn update_interval(
        &self,
        connection_id: ConnectionId,
        role: Role,
        interval: SyncInterval,
    ) -> Result<()> {
        let rows = sqlx::query(&format!(
            "UPDATE site_connections SET {}_interval = $2, updated_at = NOW() WHERE id = $1",
            role
        ))
        .bind(connection_id)
        .bind(interval.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update sync interval")?
        .rows_affected();

        Self::ensure_updated(rows, connection_id)
    }

    async fn record_sync(
        &self,
        connection_id: ConnectionId,
        role: Role,
        outcome: &ImportOutcome,
    ) -> Result<()> {
        let item_count = count_column(outcome.item_count)?;
        let rows = sqlx::query(&format!(
            r#"
            UPDATE site_connections
            SET {role}_last_sync = $2,
                {role}_count = $3,
                {role}_last_error = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
            role = role
        ))
        .bind(connection_id)
        .bind(outcome.last_sync)
        .bind(item_count)
        .execute(&self.pool)
        .await
        .context("Failed to record sync")?
        .rows_affected();

        Self::ensure_updated(rows, connection_id)
    }

    async fn record_sync_failure(
        &self,
        connection_id: ConnectionId,
        role: Role,
        error: &str,
    ) -> Result<()> {
        let rows = sqlx::query(&format!(
            "UPDATE site_connections SET {}_last_error = $2, updated_at = NOW() WHERE id = $1",
            role
        ))
        .bind(connection_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to record sync failure")?
        .rows_affected();

        Self::ensure_updated(rows, connection_id)
    }

    async fn try_claim_sync(
        &self,
        connection_id: ConnectionId,
        role: Role,
        stale_after: Duration,
    ) -> Result<bool> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE site_connections
            SET {role}_sync_started_at = NOW()
            WHERE id = $1
              AND ({role}_sync_started_at IS NULL
                   OR {role}_sync_started_at < NOW() - make_interval(secs => $2))
            "#,
            role = role
        ))
        .bind(connection_id)
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("Failed to claim sync")?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn release_sync(&self, connection_id: ConnectionId, role: Role) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE site_connections SET {}_sync_started_at = NULL WHERE id = $1",
            role
        ))
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .context("Failed to release sync claim")?;
        Ok(())
    }
}
