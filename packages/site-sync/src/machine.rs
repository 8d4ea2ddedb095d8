//! Connection state machine
//!
//! Pure decision logic - NO IO, only state transitions.
//! Adapters (the connection service, the CLI) feed events in and execute the
//! commands that come out:
//!
//! ```text
//! UrlEntry ─submit─► Testing ─probe ok─► Discovering ─endpoints─► Mapping ─confirm─► Connected
//!    ▲                  │                    │                       │                 │
//!    └──── failure / cancel ─────────────────┴───────── cancel ──────┘     edit / disconnect
//! ```
//!
//! Every probe/discovery call carries the [`Generation`] it was started
//! under. Results for any other generation are stale and dropped, which is
//! how cancellation and superseded discoveries are handled.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::connection::ConnectionConfig;
use crate::endpoints::DiscoveredEndpointSet;
use crate::error::{ConnectError, Result};
use crate::id::ConnectionId;
use crate::mapping::{MappingResolution, MappingResolver, RoleSelection};
use crate::types::{PerRole, Role};

/// Word the operator must type before synced records are deleted.
pub const DISCONNECT_CONFIRMATION: &str = "DELETE";

// ============================================================================
// STATES
// ============================================================================

/// Which step the workflow is on, without its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    UrlEntry,
    Testing,
    Discovering,
    Mapping,
    Connected,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::UrlEntry => "entering a site URL",
            StepKind::Testing => "testing the site",
            StepKind::Discovering => "discovering endpoints",
            StepKind::Mapping => "mapping endpoints",
            StepKind::Connected => "connected",
        })
    }
}

/// Monotonic counter stamped on every probe/discovery call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UrlEntry {
    /// Retained across failures so the operator can retry
    pub url: String,
    pub error: Option<String>,
    /// Saved config while editing an existing connection
    pub prior: Option<ConnectionConfig>,
}

/// Testing or discovering: a collaborator call is pending.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlight {
    pub url: String,
    pub generation: Generation,
    pub prior: Option<ConnectionConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingDraft {
    pub url: String,
    pub generation: Generation,
    /// Exactly the set that produced the suggestions on display
    pub endpoints: DiscoveredEndpointSet,
    pub resolver: MappingResolver,
    pub prior: Option<ConnectionConfig>,
    /// Confirmation is being persisted
    pub confirming: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connected {
    pub config: ConnectionConfig,
    /// Disconnect is being persisted
    pub disconnecting: bool,
}

/// Workflow step together with the data that step owns.
///
/// Editing is not a separate flag: a `UrlEntry` (or later step) holding a
/// `prior` config *is* the editing state.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStep {
    UrlEntry(UrlEntry),
    Testing(InFlight),
    Discovering(InFlight),
    Mapping(MappingDraft),
    Connected(Connected),
}

impl Default for ConnectionStep {
    fn default() -> Self {
        ConnectionStep::UrlEntry(UrlEntry::default())
    }
}

impl ConnectionStep {
    pub fn kind(&self) -> StepKind {
        match self {
            ConnectionStep::UrlEntry(_) => StepKind::UrlEntry,
            ConnectionStep::Testing(_) => StepKind::Testing,
            ConnectionStep::Discovering(_) => StepKind::Discovering,
            ConnectionStep::Mapping(_) => StepKind::Mapping,
            ConnectionStep::Connected(_) => StepKind::Connected,
        }
    }

    /// A discovery, confirmation or disconnect is pending.
    pub fn is_busy(&self) -> bool {
        match self {
            ConnectionStep::Testing(_) | ConnectionStep::Discovering(_) => true,
            ConnectionStep::Mapping(draft) => draft.confirming,
            ConnectionStep::Connected(connected) => connected.disconnecting,
            ConnectionStep::UrlEntry(_) => false,
        }
    }

    /// Saved config, whether connected or editing.
    pub fn config(&self) -> Option<&ConnectionConfig> {
        match self {
            ConnectionStep::UrlEntry(entry) => entry.prior.as_ref(),
            ConnectionStep::Testing(in_flight) | ConnectionStep::Discovering(in_flight) => {
                in_flight.prior.as_ref()
            }
            ConnectionStep::Mapping(draft) => draft.prior.as_ref(),
            ConnectionStep::Connected(connected) => Some(&connected.config),
        }
    }

    fn config_mut(&mut self) -> Option<&mut ConnectionConfig> {
        match self {
            ConnectionStep::UrlEntry(entry) => entry.prior.as_mut(),
            ConnectionStep::Testing(in_flight) | ConnectionStep::Discovering(in_flight) => {
                in_flight.prior.as_mut()
            }
            ConnectionStep::Mapping(draft) => draft.prior.as_mut(),
            ConnectionStep::Connected(connected) => Some(&mut connected.config),
        }
    }
}

// ============================================================================
// EVENTS (facts and operator intents) / COMMANDS (IO requests)
// ============================================================================

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    UrlSubmitted {
        url: String,
    },
    ProbeSucceeded {
        generation: Generation,
    },
    ProbeFailed {
        generation: Generation,
        error: String,
    },
    DiscoveryCompleted {
        generation: Generation,
        endpoints: DiscoveredEndpointSet,
    },
    DiscoveryFailed {
        generation: Generation,
        error: String,
    },
    DiscoveryCancelled,
    EndpointSelected {
        role: Role,
        selection: RoleSelection,
    },
    /// Explicit endpoints; `None` means "don't sync" for that role
    MappingConfirmed {
        community: Option<String>,
        property: Option<String>,
    },
    /// Confirm whatever the resolver currently resolves to
    SelectionConfirmed,
    /// Empty discovery: connect without syncing either role
    SkipSyncConfirmed,
    MappingCancelled,
    ConfigPersisted {
        config: ConnectionConfig,
    },
    PersistFailed {
        error: String,
    },
    EditRequested,
    EditCancelled,
    /// Saved config changed outside the workflow (endpoint edit, interval, sync)
    ConfigUpdated {
        config: ConnectionConfig,
    },
    DisconnectRequested {
        delete_synced_data: bool,
        confirmation: Option<String>,
    },
    Disconnected,
    DisconnectFailed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCommand {
    ProbeSite {
        url: String,
        generation: Generation,
    },
    DiscoverEndpoints {
        url: String,
        generation: Generation,
    },
    /// Store the confirmed mapping. For an existing connection only the site
    /// and endpoints are rewritten; schedule and sync state stay as stored.
    PersistMapping {
        config: ConnectionConfig,
        conflict: bool,
    },
    DeleteConnection {
        connection_id: ConnectionId,
        cascade: bool,
    },
}

// ============================================================================
// MACHINE
// ============================================================================

/// Connection workflow for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    connection_id: ConnectionId,
    step: ConnectionStep,
    generation: Generation,
}

impl ConnectionMachine {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self::restore(connection_id, None)
    }

    /// Rebuild from persisted state: a saved config means connected.
    pub fn restore(connection_id: ConnectionId, config: Option<ConnectionConfig>) -> Self {
        let step = match config {
            Some(config) => ConnectionStep::Connected(Connected {
                config,
                disconnecting: false,
            }),
            None => ConnectionStep::default(),
        };

        Self {
            connection_id,
            step,
            generation: Generation::default(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn step(&self) -> &ConnectionStep {
        &self.step
    }

    pub fn kind(&self) -> StepKind {
        self.step.kind()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.step.config()
    }

    pub fn resolver(&self) -> Option<&MappingResolver> {
        match &self.step {
            ConnectionStep::Mapping(draft) => Some(&draft.resolver),
            _ => None,
        }
    }

    /// Saved config, if the connection is settled in `Connected`.
    ///
    /// Endpoint, interval and extraction-mode changes go through this.
    pub fn connected_config(&self, action: &'static str) -> Result<&ConnectionConfig> {
        match &self.step {
            ConnectionStep::Connected(connected) if connected.disconnecting => {
                Err(ConnectError::OperationInFlight {
                    step: StepKind::Connected,
                })
            }
            ConnectionStep::Connected(connected) => Ok(&connected.config),
            step if step.config().is_none() => Err(ConnectError::NotConnected),
            step => Err(ConnectError::InvalidTransition {
                step: step.kind(),
                action,
            }),
        }
    }

    /// Apply one event.
    ///
    /// `Err` means the event was rejected and the step kind is unchanged. A
    /// rejected URL on the entry form is still kept there with its error so
    /// the operator can correct it.
    /// `Ok(Some(command))` asks the adapter to perform IO and report back.
    pub fn decide(&mut self, event: ConnectionEvent) -> Result<Option<ConnectionCommand>> {
        let from = self.kind();

        let command = match event {
            ConnectionEvent::UrlSubmitted { url } => self.submit_url(url).map(Some)?,
            ConnectionEvent::ProbeSucceeded { generation } => self.probe_succeeded(generation),
            ConnectionEvent::ProbeFailed { generation, error }
            | ConnectionEvent::DiscoveryFailed { generation, error } => {
                self.discovery_failed(generation, error);
                None
            }
            ConnectionEvent::DiscoveryCompleted {
                generation,
                endpoints,
            } => {
                self.discovery_completed(generation, endpoints);
                None
            }
            ConnectionEvent::DiscoveryCancelled => {
                self.cancel_discovery()?;
                None
            }
            ConnectionEvent::EndpointSelected { role, selection } => {
                self.draft_mut("select an endpoint")?
                    .resolver
                    .select(role, selection)?;
                None
            }
            ConnectionEvent::MappingConfirmed {
                community,
                property,
            } => Some(self.confirm(PerRole::new(community, property))?),
            ConnectionEvent::SelectionConfirmed => {
                let MappingResolution { endpoints, .. } = self.mapping_draft()?.resolver.resolution();
                Some(self.confirm(endpoints)?)
            }
            ConnectionEvent::SkipSyncConfirmed => Some(self.confirm_skip()?),
            ConnectionEvent::MappingCancelled => {
                self.cancel_mapping()?;
                None
            }
            ConnectionEvent::ConfigPersisted { config } => {
                self.config_persisted(config);
                None
            }
            ConnectionEvent::PersistFailed { error } => {
                if let ConnectionStep::Mapping(draft) = &mut self.step {
                    tracing::warn!(connection_id = %self.connection_id, "Mapping not saved: {}", error);
                    draft.confirming = false;
                }
                None
            }
            ConnectionEvent::EditRequested => {
                self.edit()?;
                None
            }
            ConnectionEvent::EditCancelled => {
                self.cancel_edit()?;
                None
            }
            ConnectionEvent::ConfigUpdated { config } => {
                if let Some(current) = self.step.config_mut() {
                    *current = config;
                }
                None
            }
            ConnectionEvent::DisconnectRequested {
                delete_synced_data,
                confirmation,
            } => Some(self.request_disconnect(delete_synced_data, confirmation.as_deref())?),
            ConnectionEvent::Disconnected => {
                if matches!(&self.step, ConnectionStep::Connected(c) if c.disconnecting) {
                    self.generation = self.generation.next();
                    self.step = ConnectionStep::default();
                }
                None
            }
            ConnectionEvent::DisconnectFailed { error } => {
                if let ConnectionStep::Connected(connected) = &mut self.step {
                    tracing::warn!(connection_id = %self.connection_id, "Disconnect failed: {}", error);
                    connected.disconnecting = false;
                }
                None
            }
        };

        let to = self.kind();
        if from != to {
            tracing::info!(
                connection_id = %self.connection_id,
                generation = %self.generation,
                "Connection step {:?} -> {:?}",
                from,
                to
            );
        }

        Ok(command)
    }

    // ------------------------------------------------------------------------
    // discovery
    // ------------------------------------------------------------------------

    fn submit_url(&mut self, raw: String) -> Result<ConnectionCommand> {
        let (url, prior) = match &mut self.step {
            ConnectionStep::UrlEntry(entry) => match normalize_site_url(&raw) {
                Ok(url) => {
                    entry.url = url.clone();
                    (url, entry.prior.take())
                }
                Err(err) => {
                    entry.url = raw;
                    entry.error = Some(err.to_string());
                    return Err(err);
                }
            },
            // re-running discovery replaces the displayed set
            ConnectionStep::Mapping(draft) if !draft.confirming => {
                let url = normalize_site_url(&raw)?;
                (url, draft.prior.take())
            }
            step if step.is_busy() => {
                return Err(ConnectError::OperationInFlight { step: step.kind() })
            }
            step => {
                return Err(ConnectError::InvalidTransition {
                    step: step.kind(),
                    action: "submit a site URL",
                })
            }
        };

        self.generation = self.generation.next();
        self.step = ConnectionStep::Testing(InFlight {
            url: url.clone(),
            generation: self.generation,
            prior,
        });

        Ok(ConnectionCommand::ProbeSite {
            url,
            generation: self.generation,
        })
    }

    fn probe_succeeded(&mut self, generation: Generation) -> Option<ConnectionCommand> {
        let ConnectionStep::Testing(in_flight) = &mut self.step else {
            self.discard_stale("probe result", generation);
            return None;
        };
        if in_flight.generation != generation {
            self.discard_stale("probe result", generation);
            return None;
        }

        let next = InFlight {
            url: in_flight.url.clone(),
            generation,
            prior: in_flight.prior.take(),
        };
        let command = ConnectionCommand::DiscoverEndpoints {
            url: next.url.clone(),
            generation,
        };
        self.step = ConnectionStep::Discovering(next);
        Some(command)
    }

    fn discovery_completed(&mut self, generation: Generation, endpoints: DiscoveredEndpointSet) {
        let ConnectionStep::Discovering(in_flight) = &mut self.step else {
            self.discard_stale("discovery result", generation);
            return;
        };
        if in_flight.generation != generation {
            self.discard_stale("discovery result", generation);
            return;
        }

        let endpoints = endpoints.normalized();
        let resolver = MappingResolver::new(&endpoints);
        if resolver.is_empty() {
            tracing::info!(
                connection_id = %self.connection_id,
                url = %in_flight.url,
                "Site reachable but no custom content types found"
            );
        }

        self.step = ConnectionStep::Mapping(MappingDraft {
            url: in_flight.url.clone(),
            generation,
            endpoints,
            resolver,
            prior: in_flight.prior.take(),
            confirming: false,
        });
    }

    fn discovery_failed(&mut self, generation: Generation, error: String) {
        let pending = matches!(
            &self.step,
            ConnectionStep::Testing(in_flight) | ConnectionStep::Discovering(in_flight)
                if in_flight.generation == generation
        );
        if !pending {
            self.discard_stale("discovery failure", generation);
            return;
        }

        if let ConnectionStep::Testing(in_flight) | ConnectionStep::Discovering(in_flight) =
            &mut self.step
        {
            let entry = UrlEntry {
                url: in_flight.url.clone(),
                error: Some(error),
                prior: in_flight.prior.take(),
            };
            self.step = ConnectionStep::UrlEntry(entry);
        }
    }

    fn cancel_discovery(&mut self) -> Result<()> {
        let in_flight = match &mut self.step {
            ConnectionStep::Testing(in_flight) | ConnectionStep::Discovering(in_flight) => in_flight,
            step => {
                return Err(ConnectError::InvalidTransition {
                    step: step.kind(),
                    action: "cancel discovery",
                })
            }
        };

        let entry = UrlEntry {
            url: in_flight.url.clone(),
            error: None,
            prior: in_flight.prior.take(),
        };
        // anything still in flight is now stale
        self.generation = self.generation.next();
        self.step = ConnectionStep::UrlEntry(entry);
        Ok(())
    }

    fn discard_stale(&self, what: &str, generation: Generation) {
        tracing::debug!(
            connection_id = %self.connection_id,
            stale = %generation,
            current = %self.generation,
            step = ?self.kind(),
            "Discarding stale {}",
            what
        );
    }

    // ------------------------------------------------------------------------
    // mapping
    // ------------------------------------------------------------------------

    fn mapping_draft(&self) -> Result<&MappingDraft> {
        match &self.step {
            ConnectionStep::Mapping(draft) if draft.confirming => {
                Err(ConnectError::OperationInFlight {
                    step: StepKind::Mapping,
                })
            }
            ConnectionStep::Mapping(draft) => Ok(draft),
            step => Err(ConnectError::confirmation(format!(
                "nothing to confirm while {}",
                step.kind()
            ))),
        }
    }

    fn draft_mut(&mut self, action: &'static str) -> Result<&mut MappingDraft> {
        match &mut self.step {
            ConnectionStep::Mapping(draft) if draft.confirming => {
                Err(ConnectError::OperationInFlight {
                    step: StepKind::Mapping,
                })
            }
            ConnectionStep::Mapping(draft) => Ok(draft),
            step => Err(ConnectError::InvalidTransition {
                step: step.kind(),
                action,
            }),
        }
    }

    fn confirm(&mut self, endpoints: PerRole<Option<String>>) -> Result<ConnectionCommand> {
        let draft = self.mapping_draft()?;

        if endpoints.iter().all(|(_, endpoint)| endpoint.is_none()) {
            return Err(ConnectError::confirmation(
                "select an endpoint for at least one feed",
            ));
        }
        for (_, endpoint) in endpoints.iter() {
            if let Some(rest_base) = endpoint {
                if !draft.resolver.contains(rest_base) {
                    return Err(ConnectError::UnknownEndpoint {
                        rest_base: rest_base.clone(),
                    });
                }
            }
        }

        let connection_id = self.connection_id;
        let draft = self.draft_mut("confirm mapping")?;
        for role in Role::ALL {
            let selection = match &endpoints[role] {
                Some(rest_base) => RoleSelection::Explicit(rest_base.clone()),
                None => RoleSelection::Skip,
            };
            draft.resolver.select(role, selection)?;
        }

        let config =
            ConnectionConfig::reconfirmed(connection_id, &draft.url, endpoints, draft.prior.as_ref());
        let conflict = config.has_role_conflict();
        if conflict {
            tracing::warn!(
                connection_id = %connection_id,
                endpoint = ?config.endpoint(Role::Community),
                "Same endpoint mapped as both community and property feed"
            );
        }

        draft.confirming = true;
        Ok(ConnectionCommand::PersistMapping { config, conflict })
    }

    fn confirm_skip(&mut self) -> Result<ConnectionCommand> {
        let connection_id = self.connection_id;
        if !self.mapping_draft()?.resolver.is_empty() {
            return Err(ConnectError::confirmation(
                "endpoints were discovered; select one or cancel",
            ));
        }

        let draft = self.draft_mut("confirm mapping")?;
        let config = ConnectionConfig::reconfirmed(
            connection_id,
            &draft.url,
            PerRole::default(),
            draft.prior.as_ref(),
        );
        draft.confirming = true;
        Ok(ConnectionCommand::PersistMapping {
            config,
            conflict: false,
        })
    }

    fn config_persisted(&mut self, config: ConnectionConfig) {
        if matches!(&self.step, ConnectionStep::Mapping(draft) if draft.confirming) {
            self.step = ConnectionStep::Connected(Connected {
                config,
                disconnecting: false,
            });
        } else {
            tracing::debug!(
                connection_id = %self.connection_id,
                step = ?self.kind(),
                "Ignoring persisted mapping outside confirmation"
            );
        }
    }

    fn cancel_mapping(&mut self) -> Result<()> {
        let draft = self.draft_mut("cancel mapping")?;
        let entry = UrlEntry {
            url: draft.url.clone(),
            error: None,
            prior: draft.prior.take(),
        };
        self.generation = self.generation.next();
        self.step = ConnectionStep::UrlEntry(entry);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // edit / disconnect
    // ------------------------------------------------------------------------

    fn connected_mut(&mut self, action: &'static str) -> Result<&mut Connected> {
        match &mut self.step {
            ConnectionStep::Connected(connected) if connected.disconnecting => {
                Err(ConnectError::OperationInFlight {
                    step: StepKind::Connected,
                })
            }
            ConnectionStep::Connected(connected) => Ok(connected),
            step if step.config().is_none() => Err(ConnectError::NotConnected),
            step => Err(ConnectError::InvalidTransition {
                step: step.kind(),
                action,
            }),
        }
    }

    fn edit(&mut self) -> Result<()> {
        let connected = self.connected_mut("edit the connection")?;
        let config = connected.config.clone();
        self.step = ConnectionStep::UrlEntry(UrlEntry {
            url: config.site_url.clone(),
            error: None,
            prior: Some(config),
        });
        Ok(())
    }

    fn cancel_edit(&mut self) -> Result<()> {
        match &mut self.step {
            ConnectionStep::UrlEntry(entry) if entry.prior.is_some() => {
                if let Some(config) = entry.prior.take() {
                    self.step = ConnectionStep::Connected(Connected {
                        config,
                        disconnecting: false,
                    });
                }
                Ok(())
            }
            step => Err(ConnectError::InvalidTransition {
                step: step.kind(),
                action: "cancel editing",
            }),
        }
    }

    fn request_disconnect(
        &mut self,
        delete_synced_data: bool,
        confirmation: Option<&str>,
    ) -> Result<ConnectionCommand> {
        let connection_id = self.connection_id;
        let connected = self.connected_mut("disconnect")?;

        if delete_synced_data && confirmation != Some(DISCONNECT_CONFIRMATION) {
            return Err(ConnectError::DisconnectCascadeDenied);
        }

        connected.disconnecting = true;
        Ok(ConnectionCommand::DeleteConnection {
            connection_id,
            cascade: delete_synced_data,
        })
    }
}

/// Trim, assume `https://` when no scheme is given, and require an
/// http(s) URL with a host. Trailing slashes are dropped.
pub fn normalize_site_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let invalid = || ConnectError::InvalidUrl {
        url: raw.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid());
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = Url::parse(&candidate).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(invalid());
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}
