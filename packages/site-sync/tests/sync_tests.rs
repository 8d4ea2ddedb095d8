//! Sync triggering, per-role serialization and the due-sync driver.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use common::{Gate, MockImporter, MockSiteDiscovery, TestHarness};
use site_sync::{
    BaseConnectionStore, ConnectError, ConnectionConfig, ConnectionId, ConnectionService,
    ConnectorDeps, Role, SyncInterval, SyncRunner, Timeouts,
};

async fn connected(harness: &TestHarness) -> Arc<ConnectionService> {
    let service = ConnectionService::new(harness.deps.clone(), ConnectionId::new());
    service.submit_url("example.org").await.unwrap();
    service.confirm_selection().await.unwrap();
    Arc::new(service)
}

#[tokio::test]
async fn overlapping_same_role_syncs_never_interleave() {
    let gate = Gate::closed();
    let harness = TestHarness::new(
        MockSiteDiscovery::new(),
        MockImporter::new()
            .with_gate(Role::Community, gate.clone())
            .with_count(Role::Community, 5)
            .with_count(Role::Property, 7),
    );
    let service = connected(&harness).await;
    let id = service.connection_id();

    let first = {
        let service = service.clone();
        tokio::spawn(async move { service.trigger_sync(Role::Community, false).await })
    };
    gate.entered.notified().await;
    assert!(service.snapshot().await.syncing.community);

    // same role: rejected while the first is running
    let err = service.trigger_sync(Role::Community, true).await.unwrap_err();
    assert!(matches!(err, ConnectError::SyncInProgress { role: Role::Community }));

    // other role: runs to completion in the meantime
    let property = service.trigger_sync(Role::Property, false).await.unwrap();
    assert_eq!(property.item_count, 7);
    let saved = harness.store.load(id).await.unwrap().unwrap();
    assert_eq!(saved.count(Role::Property), 7);
    assert!(saved.last_sync(Role::Community).is_none());

    gate.release(1);
    let community = first.await.unwrap().unwrap();
    assert_eq!(community.item_count, 5);

    assert_eq!(harness.importer.calls_for(Role::Community), 1);
    assert_eq!(harness.importer.max_concurrent(Role::Community), 1);

    let saved = harness.store.load(id).await.unwrap().unwrap();
    assert_eq!(saved.count(Role::Community), 5);
    assert_eq!(saved.count(Role::Property), 7);
    assert!(!service.snapshot().await.syncing.community);

    // slot released: the role can sync again
    gate.release(1);
    service.trigger_sync(Role::Community, false).await.unwrap_or_else(|e| {
        panic!("second community sync should run after the first: {}", e)
    });
}

#[tokio::test]
async fn workers_sharing_a_store_never_sync_the_same_role_together() {
    let gate = Gate::closed();
    let harness = TestHarness::new(
        MockSiteDiscovery::new(),
        MockImporter::new().with_gate(Role::Community, gate.clone()),
    );
    let service = connected(&harness).await;
    let id = service.connection_id();

    // a second worker: same store, its own in-process slots
    let other = SyncRunner::new(ConnectorDeps::new(
        harness.discovery.clone(),
        harness.importer.clone(),
        Arc::new(harness.store.clone()),
    ));

    let first = {
        let runner = service.runner().clone();
        tokio::spawn(async move { runner.run_role(id, Role::Community, false).await })
    };
    gate.entered.notified().await;
    assert!(!other.is_running(id, Role::Community));

    let err = other.run_role(id, Role::Community, true).await.unwrap_err();
    assert!(matches!(err, ConnectError::SyncInProgress { role: Role::Community }));
    assert_eq!(other.run_due_syncs(Utc::now()).await.unwrap(), 1);
    assert_eq!(harness.importer.calls_for(Role::Property), 1);

    gate.release(1);
    first.await.unwrap().unwrap();
    assert_eq!(harness.importer.max_concurrent(Role::Community), 1);

    // claim released: the other worker can take the role now
    gate.release(1);
    other.run_role(id, Role::Community, true).await.unwrap();
    assert_eq!(harness.importer.calls_for(Role::Community), 2);
}

#[tokio::test]
async fn endpoint_edit_during_sync_is_not_overwritten() {
    let gate = Gate::closed();
    let harness = TestHarness::new(
        MockSiteDiscovery::new(),
        MockImporter::new()
            .with_gate(Role::Community, gate.clone())
            .with_count(Role::Community, 3),
    );
    let service = connected(&harness).await;
    let id = service.connection_id();

    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.trigger_sync(Role::Community, false).await })
    };
    gate.entered.notified().await;

    service
        .update_endpoint(Role::Property, Some("/homes"))
        .await
        .unwrap();

    gate.release(1);
    running.await.unwrap().unwrap();

    let saved = harness.store.load(id).await.unwrap().unwrap();
    assert_eq!(saved.endpoint(Role::Property), Some("/homes"));
    assert_eq!(saved.count(Role::Community), 3);
    assert_eq!(service.config().await, Some(saved));
}

#[tokio::test]
async fn failure_is_recorded_against_one_role_only() {
    let harness = TestHarness::new(
        MockSiteDiscovery::new(),
        MockImporter::new()
            .with_count(Role::Community, 4)
            .with_failure(Role::Property, "upstream returned 502")
            .with_count(Role::Property, 9),
    );
    let service = connected(&harness).await;

    service.trigger_sync(Role::Community, false).await.unwrap();
    let err = service.trigger_sync(Role::Property, false).await.unwrap_err();
    assert_eq!(err.to_string(), "property sync failed: upstream returned 502");

    let config = service.config().await.unwrap();
    assert_eq!(config.count(Role::Community), 4);
    assert!(config.sync[Role::Community].last_error.is_none());
    assert_eq!(
        config.sync[Role::Property].last_error.as_deref(),
        Some("upstream returned 502")
    );
    assert!(config.last_sync(Role::Property).is_none());

    // not retried automatically; a manual retry clears the error
    assert_eq!(harness.importer.calls_for(Role::Property), 1);
    service.trigger_sync(Role::Property, false).await.unwrap();
    let config = service.config().await.unwrap();
    assert_eq!(config.count(Role::Property), 9);
    assert!(config.sync[Role::Property].last_error.is_none());
}

#[tokio::test]
async fn slow_import_times_out_and_releases_the_slot() {
    let gate = Gate::closed();
    let mut harness = TestHarness::new(
        MockSiteDiscovery::new(),
        MockImporter::new().with_gate(Role::Property, gate.clone()),
    );
    harness.deps = harness.deps.clone().with_timeouts(Timeouts {
        import: Duration::from_millis(50),
        ..Timeouts::default()
    });
    let service = connected(&harness).await;

    let err = service.trigger_sync(Role::Property, false).await.unwrap_err();
    assert!(matches!(err, ConnectError::Timeout { operation: "import", .. }));
    assert!(!service.snapshot().await.syncing.property);

    let config = service.config().await.unwrap();
    assert!(config.sync[Role::Property].last_error.is_some());
}

#[tokio::test]
async fn full_resync_is_flagged_on_the_request() {
    let harness = TestHarness::default_mocks();
    let service = connected(&harness).await;

    service.trigger_sync(Role::Property, true).await.unwrap();

    let calls = harness.importer.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].full);
    assert_eq!(calls[0].site_url, "https://example.org");
    assert_eq!(calls[0].connection_id, service.connection_id());
}

#[tokio::test]
async fn driver_runs_only_due_roles() {
    let harness = TestHarness::default_mocks();
    let store = &harness.store;
    let now = Utc::now();

    // never synced, daily: due
    let fresh = ConnectionConfig::new(ConnectionId::new(), "https://a.example.org")
        .with_endpoint(Role::Community, Some("/community"))
        .with_endpoint(Role::Property, Some("/listing"))
        .with_interval(Role::Property, SyncInterval::Manual);
    store.save(&fresh).await.unwrap();

    // synced two hours ago: due at hourly_1, not at hourly_4
    let mut recent = ConnectionConfig::new(ConnectionId::new(), "https://b.example.org")
        .with_endpoint(Role::Community, Some("/places"))
        .with_endpoint(Role::Property, Some("/homes"))
        .with_interval(Role::Community, SyncInterval::Hourly1)
        .with_interval(Role::Property, SyncInterval::Hourly4);
    recent.sync[Role::Community].last_sync = Some(now - ChronoDuration::hours(2));
    recent.sync[Role::Property].last_sync = Some(now - ChronoDuration::hours(2));
    store.save(&recent).await.unwrap();

    // no endpoint: never due
    let disabled = ConnectionConfig::new(ConnectionId::new(), "https://c.example.org");
    store.save(&disabled).await.unwrap();

    let runner = SyncRunner::new(harness.deps.clone());
    let completed = runner.run_due_syncs(now).await.unwrap();
    assert_eq!(completed, 2);

    let mut synced: Vec<(String, Role)> = harness
        .importer
        .calls()
        .into_iter()
        .map(|c| (c.endpoint, c.role))
        .collect();
    synced.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        synced,
        vec![
            ("/community".to_string(), Role::Community),
            ("/places".to_string(), Role::Community),
        ]
    );
    assert!(harness.importer.calls().iter().all(|c| !c.full));

    // just synced: nothing due until the next interval
    let completed = runner.run_due_syncs(Utc::now()).await.unwrap();
    assert_eq!(completed, 0);
}

#[tokio::test]
async fn driver_skips_roles_already_syncing() {
    let gate = Gate::closed();
    let harness = TestHarness::new(
        MockSiteDiscovery::new(),
        MockImporter::new().with_gate(Role::Community, gate.clone()),
    );
    let service = connected(&harness).await;

    let manual = {
        let service = service.clone();
        tokio::spawn(async move { service.trigger_sync(Role::Community, false).await })
    };
    gate.entered.notified().await;

    // property is due (never synced); community is busy with the manual sync
    let completed = service.runner().run_due_syncs(Utc::now()).await.unwrap();
    assert_eq!(completed, 1);
    assert_eq!(harness.importer.calls_for(Role::Community), 1);
    assert_eq!(harness.importer.calls_for(Role::Property), 1);

    gate.release(1);
    manual.await.unwrap().unwrap();
}
