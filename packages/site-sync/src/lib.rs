//! Site connector: discover a remote CMS site's content types, map them to
//! the Community and Property feeds, and keep both feeds synced.
//!
//! Pure decision logic lives in [`classifier`], [`mapping`], [`machine`] and
//! the due calculation in [`scheduler`]; [`service`] and [`scheduler::SyncRunner`]
//! drive it against the collaborators in [`traits`].

pub mod classifier;
pub mod config;
pub mod connection;
pub mod deps;
pub mod endpoints;
pub mod error;
pub mod http;
pub mod id;
pub mod machine;
pub mod mapping;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod traits;
pub mod types;

pub use classifier::{contextual_confidence, ConfidenceBand};
pub use config::Config;
pub use connection::{ConnectionConfig, RoleSyncState};
pub use deps::{ConnectorDeps, Timeouts};
pub use endpoints::{Classification, DiscoveredEndpoint, DiscoveredEndpointSet};
pub use error::{ConnectError, Result};
pub use http::{HttpImporter, HttpSiteDiscovery};
pub use id::{Connection, ConnectionId, Id};
pub use machine::{
    normalize_site_url, ConnectionCommand, ConnectionEvent, ConnectionMachine, ConnectionStep,
    Generation, StepKind, DISCONNECT_CONFIRMATION,
};
pub use mapping::{rank_candidates, MappingResolution, MappingResolver, RankedCandidate, RoleSelection};
pub use scheduler::{format_last_sync, is_due, start_scheduler, SyncRunner, SyncSlots};
pub use service::{ConnectionService, ConnectionSnapshot};
pub use storage::{InMemoryConnectionStore, PostgresConnectionStore};
pub use traits::{BaseConnectionStore, BaseImporter, BaseSiteDiscovery, ImportOutcome, ImportRequest};
pub use types::{ExtractionMode, PerRole, Role, SyncInterval};
