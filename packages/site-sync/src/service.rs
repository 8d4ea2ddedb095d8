//! Connection service
//!
//! Async adapter around [`ConnectionMachine`]: feeds operator intents and
//! collaborator results into the machine and executes the commands it
//! returns. The machine lock is never held across a collaborator call, so a
//! cancel can land while discovery is still running.

use anyhow::Context;
use serde::Serialize;
use std::future::Future;
use tokio::sync::Mutex;

use crate::connection::ConnectionConfig;
use crate::deps::{within, ConnectorDeps};
use crate::error::{ConnectError, Result};
use crate::id::ConnectionId;
use crate::machine::{
    ConnectionCommand, ConnectionEvent, ConnectionMachine, ConnectionStep, Generation, StepKind,
};
use crate::mapping::{RankedCandidate, RoleSelection};
use crate::scheduler::SyncRunner;
use crate::traits::ImportOutcome;
use crate::types::{ExtractionMode, PerRole, Role, SyncInterval};

/// Point-in-time view of a connection for display.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub step: StepKind,
    /// URL being entered, tested or mapped
    pub url: Option<String>,
    pub error: Option<String>,
    /// A saved connection is being re-discovered or re-mapped
    pub editing: bool,
    pub config: Option<ConnectionConfig>,
    /// Ranked candidates per role while mapping
    pub rankings: Option<PerRole<Vec<RankedCandidate>>>,
    /// Effective endpoint per role while mapping
    pub selected: Option<PerRole<Option<String>>>,
    pub conflict: bool,
    pub syncing: PerRole<bool>,
}

/// Collaborator failure as a short message.
fn failure_reason<T>(result: Result<anyhow::Result<T>>) -> std::result::Result<T, String> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(e) => Err(e.to_string()),
    }
}

pub struct ConnectionService {
    connection_id: ConnectionId,
    machine: Mutex<ConnectionMachine>,
    deps: ConnectorDeps,
    runner: SyncRunner,
}

impl ConnectionService {
    /// Service for a connection that has never been saved.
    pub fn new(deps: ConnectorDeps, connection_id: ConnectionId) -> Self {
        Self::with_machine(deps, ConnectionMachine::new(connection_id))
    }

    /// Service restored from the store: connected if a config is saved.
    pub async fn load(deps: ConnectorDeps, connection_id: ConnectionId) -> Result<Self> {
        let config = within(
            "loading the connection",
            deps.timeouts.store,
            deps.store.load(connection_id),
        )
        .await?
        .map_err(ConnectError::storage)?;

        Ok(Self::with_machine(
            deps,
            ConnectionMachine::restore(connection_id, config),
        ))
    }

    fn with_machine(deps: ConnectorDeps, machine: ConnectionMachine) -> Self {
        Self {
            connection_id: machine.connection_id(),
            machine: Mutex::new(machine),
            runner: SyncRunner::new(deps.clone()),
            deps,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn runner(&self) -> &SyncRunner {
        &self.runner
    }

    pub async fn step(&self) -> StepKind {
        self.machine.lock().await.kind()
    }

    pub async fn config(&self) -> Option<ConnectionConfig> {
        self.machine.lock().await.config().cloned()
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let machine = self.machine.lock().await;
        let step = machine.step();

        let (url, error) = match step {
            ConnectionStep::UrlEntry(entry) => (
                (!entry.url.is_empty()).then(|| entry.url.clone()),
                entry.error.clone(),
            ),
            ConnectionStep::Testing(in_flight) | ConnectionStep::Discovering(in_flight) => {
                (Some(in_flight.url.clone()), None)
            }
            ConnectionStep::Mapping(draft) => (Some(draft.url.clone()), None),
            ConnectionStep::Connected(connected) => (Some(connected.config.site_url.clone()), None),
        };

        let resolver = machine.resolver();
        let config = machine.config().cloned();

        ConnectionSnapshot {
            connection_id: self.connection_id,
            step: step.kind(),
            url,
            error,
            editing: !matches!(step, ConnectionStep::Connected(_)) && config.is_some(),
            conflict: match resolver {
                Some(resolver) => resolver.has_conflict(),
                None => config.as_ref().is_some_and(|c| c.has_role_conflict()),
            },
            rankings: resolver.map(|r| PerRole::from_fn(|role| r.ranked(role).to_vec())),
            selected: resolver.map(|r| PerRole::from_fn(|role| r.effective(role).map(str::to_string))),
            config,
            syncing: PerRole::from_fn(|role| self.runner.is_running(self.connection_id, role)),
        }
    }

    // ------------------------------------------------------------------------
    // discovery / mapping
    // ------------------------------------------------------------------------

    /// Test the site and discover its endpoints. Ends in `Mapping` on success.
    pub async fn submit_url(&self, url: &str) -> Result<StepKind> {
        let command = self
            .decide(ConnectionEvent::UrlSubmitted {
                url: url.to_string(),
            })
            .await?;
        self.execute(command).await?;
        Ok(self.step().await)
    }

    pub async fn cancel_discovery(&self) -> Result<()> {
        self.decide(ConnectionEvent::DiscoveryCancelled).await?;
        Ok(())
    }

    pub async fn select_endpoint(&self, role: Role, selection: RoleSelection) -> Result<()> {
        self.decide(ConnectionEvent::EndpointSelected { role, selection })
            .await?;
        Ok(())
    }

    /// Confirm explicit endpoints; `None` means "don't sync" for that role.
    pub async fn confirm_mapping(
        &self,
        community: Option<String>,
        property: Option<String>,
    ) -> Result<ConnectionConfig> {
        self.confirm(ConnectionEvent::MappingConfirmed {
            community,
            property,
        })
        .await
    }

    /// Confirm the resolver's current selection (suggestions plus overrides).
    pub async fn confirm_selection(&self) -> Result<ConnectionConfig> {
        self.confirm(ConnectionEvent::SelectionConfirmed).await
    }

    /// Connect a site that exposed no content types, syncing nothing.
    pub async fn confirm_without_sync(&self) -> Result<ConnectionConfig> {
        self.confirm(ConnectionEvent::SkipSyncConfirmed).await
    }

    pub async fn cancel_mapping(&self) -> Result<()> {
        self.decide(ConnectionEvent::MappingCancelled).await?;
        Ok(())
    }

    pub async fn edit_connection(&self) -> Result<()> {
        self.decide(ConnectionEvent::EditRequested).await?;
        Ok(())
    }

    pub async fn cancel_edit(&self) -> Result<()> {
        self.decide(ConnectionEvent::EditCancelled).await?;
        Ok(())
    }

    async fn confirm(&self, event: ConnectionEvent) -> Result<ConnectionConfig> {
        let command = self.decide(event).await?;
        self.execute(command).await?;
        self.config().await.ok_or(ConnectError::NotConnected)
    }

    // ------------------------------------------------------------------------
    // settings (field-group writes)
    // ------------------------------------------------------------------------

    /// Remap one role. `None` (or a blank value) turns that role's sync off.
    pub async fn update_endpoint(&self, role: Role, rest_base: Option<&str>) -> Result<ConnectionConfig> {
        let config = self.connected_config("change an endpoint").await?;

        let mut endpoints = config.endpoints.clone();
        endpoints[role] = rest_base
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        if matches!(
            (&endpoints[Role::Community], &endpoints[Role::Property]),
            (Some(community), Some(property)) if community == property
        ) {
            tracing::warn!(
                connection_id = %self.connection_id,
                endpoint = ?endpoints[role],
                "Same endpoint mapped as both community and property feed"
            );
        }

        self.store_call(
            "saving the endpoint mapping",
            self.deps
                .store
                .update_mapping(self.connection_id, &endpoints, config.extraction_mode),
        )
        .await?;
        tracing::info!(connection_id = %self.connection_id, %role, endpoint = ?endpoints[role], "Endpoint updated");
        self.refresh().await
    }

    pub async fn update_sync_interval(&self, role: Role, interval: SyncInterval) -> Result<ConnectionConfig> {
        self.connected_config("change the sync interval").await?;
        self.store_call(
            "saving the sync interval",
            self.deps
                .store
                .update_interval(self.connection_id, role, interval),
        )
        .await?;
        tracing::info!(connection_id = %self.connection_id, %role, %interval, "Sync interval updated");
        self.refresh().await
    }

    pub async fn update_extraction_mode(&self, mode: ExtractionMode) -> Result<ConnectionConfig> {
        let config = self.connected_config("change the extraction mode").await?;
        self.store_call(
            "saving the extraction mode",
            self.deps
                .store
                .update_mapping(self.connection_id, &config.endpoints, mode),
        )
        .await?;
        tracing::info!(connection_id = %self.connection_id, %mode, "Extraction mode updated");
        self.refresh().await
    }

    // ------------------------------------------------------------------------
    // sync / disconnect
    // ------------------------------------------------------------------------

    /// Quick sync (`full = false`) or full resync of one role.
    ///
    /// Runs alongside the other role and the workflow; a second trigger for
    /// a role that is already syncing fails with `SyncInProgress`.
    pub async fn trigger_sync(&self, role: Role, full: bool) -> Result<ImportOutcome> {
        let result = self.runner.run_role(self.connection_id, role, full).await;

        if !matches!(result, Err(ConnectError::SyncInProgress { .. })) && self.config().await.is_some() {
            if let Err(e) = self.refresh().await {
                tracing::warn!(connection_id = %self.connection_id, "Could not reload connection after sync: {}", e);
            }
        }

        result
    }

    /// Delete the connection. With `delete_synced_data`, `confirmation` must
    /// be exactly [`DISCONNECT_CONFIRMATION`](crate::machine::DISCONNECT_CONFIRMATION).
    pub async fn disconnect(&self, delete_synced_data: bool, confirmation: Option<&str>) -> Result<()> {
        let command = self
            .decide(ConnectionEvent::DisconnectRequested {
                delete_synced_data,
                confirmation: confirmation.map(str::to_string),
            })
            .await?;
        self.execute(command).await
    }

    // ------------------------------------------------------------------------
    // command execution
    // ------------------------------------------------------------------------

    async fn decide(&self, event: ConnectionEvent) -> Result<Option<ConnectionCommand>> {
        self.machine.lock().await.decide(event)
    }

    /// Apply a collaborator result; `Cancelled` if its generation went stale.
    async fn apply_result(
        &self,
        generation: Generation,
        event: ConnectionEvent,
    ) -> Result<Option<ConnectionCommand>> {
        let mut machine = self.machine.lock().await;
        let current = machine.generation() == generation;
        let command = machine.decide(event)?;
        if !current {
            return Err(ConnectError::Cancelled);
        }
        Ok(command)
    }

    async fn execute(&self, mut next: Option<ConnectionCommand>) -> Result<()> {
        let timeouts = self.deps.timeouts;

        while let Some(command) = next.take() {
            next = match command {
                ConnectionCommand::ProbeSite { url, generation } => {
                    let result = within(
                        "site probe",
                        timeouts.discovery,
                        self.deps.discovery.probe(&url),
                    )
                    .await;
                    match failure_reason(result) {
                        Ok(()) => {
                            self.apply_result(generation, ConnectionEvent::ProbeSucceeded { generation })
                                .await?
                        }
                        Err(reason) => {
                            self.apply_result(
                                generation,
                                ConnectionEvent::ProbeFailed {
                                    generation,
                                    error: reason.clone(),
                                },
                            )
                            .await?;
                            return Err(ConnectError::DiscoveryUnreachable { url, reason });
                        }
                    }
                }

                ConnectionCommand::DiscoverEndpoints { url, generation } => {
                    let result = within(
                        "discovery",
                        timeouts.discovery,
                        self.deps.discovery.discover(&url),
                    )
                    .await;
                    match failure_reason(result) {
                        Ok(endpoints) => {
                            tracing::info!(
                                connection_id = %self.connection_id,
                                %url,
                                found = endpoints.len(),
                                "Discovery finished"
                            );
                            self.apply_result(
                                generation,
                                ConnectionEvent::DiscoveryCompleted {
                                    generation,
                                    endpoints,
                                },
                            )
                            .await?
                        }
                        Err(reason) => {
                            self.apply_result(
                                generation,
                                ConnectionEvent::DiscoveryFailed {
                                    generation,
                                    error: reason.clone(),
                                },
                            )
                            .await?;
                            return Err(ConnectError::DiscoveryUnreachable { url, reason });
                        }
                    }
                }

                ConnectionCommand::PersistMapping { config, .. } => {
                    let result = within(
                        "saving the connection",
                        timeouts.store,
                        self.persist_mapping(&config),
                    )
                    .await;
                    let error = match result {
                        Ok(Ok(config)) => {
                            tracing::info!(
                                connection_id = %self.connection_id,
                                site_url = %config.site_url,
                                community = ?config.endpoint(Role::Community),
                                property = ?config.endpoint(Role::Property),
                                "Connection saved"
                            );
                            self.decide(ConnectionEvent::ConfigPersisted { config })
                                .await?;
                            continue;
                        }
                        Ok(Err(e)) => ConnectError::storage(e),
                        Err(timeout) => timeout,
                    };
                    self.decide(ConnectionEvent::PersistFailed {
                        error: error.to_string(),
                    })
                    .await?;
                    return Err(error);
                }

                ConnectionCommand::DeleteConnection {
                    connection_id,
                    cascade,
                } => {
                    let result = within(
                        "deleting the connection",
                        timeouts.store,
                        self.deps.store.delete(connection_id, cascade),
                    )
                    .await;
                    let error = match result {
                        Ok(Ok(())) => {
                            tracing::info!(%connection_id, cascade, "Site disconnected");
                            self.decide(ConnectionEvent::Disconnected).await?;
                            continue;
                        }
                        Ok(Err(e)) => ConnectError::storage(e),
                        Err(timeout) => timeout,
                    };
                    self.decide(ConnectionEvent::DisconnectFailed {
                        error: error.to_string(),
                    })
                    .await?;
                    return Err(error);
                }
            };
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------------

    async fn connected_config(&self, action: &'static str) -> Result<ConnectionConfig> {
        self.machine
            .lock()
            .await
            .connected_config(action)
            .cloned()
    }

    /// Write a confirmed mapping and return the connection as stored.
    ///
    /// An existing row only gets its mapping remapped, so schedule and sync
    /// writes made while the mapping was being edited survive. A new
    /// connection is written whole.
    async fn persist_mapping(&self, config: &ConnectionConfig) -> anyhow::Result<ConnectionConfig> {
        let store = &self.deps.store;
        let id = config.connection_id;
        if !store.remap(id, &config.site_url, &config.endpoints).await? {
            store.save(config).await?;
            return Ok(config.clone());
        }
        store
            .load(id)
            .await?
            .context("connection removed while saving the mapping")
    }

    async fn store_call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        within(operation, self.deps.timeouts.store, fut)
            .await?
            .map_err(ConnectError::storage)
    }

    /// Reload the saved config and hand it to the machine.
    async fn refresh(&self) -> Result<ConnectionConfig> {
        let config = self
            .store_call(
                "loading the connection",
                self.deps.store.load(self.connection_id),
            )
            .await?
            .ok_or(ConnectError::NotConnected)?;
        self.decide(ConnectionEvent::ConfigUpdated {
            config: config.clone(),
        })
        .await?;
        Ok(config)
    }
}
