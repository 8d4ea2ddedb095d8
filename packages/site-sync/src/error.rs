//! Typed errors for the site connector.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so the CLI and any
//! other adapter can match on the kind and show the short message as-is.

use thiserror::Error;

use crate::machine::StepKind;
use crate::types::Role;

pub type Result<T, E = ConnectError> = std::result::Result<T, E>;

/// Errors surfaced to the operator by the connection workflow and syncs.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The submitted URL is not an http(s) URL
    #[error("invalid site URL: {url}")]
    InvalidUrl { url: String },

    /// Site did not respond or exposes no REST API
    #[error("could not reach {url}: {reason}")]
    DiscoveryUnreachable { url: String, reason: String },

    /// Mapping confirmation rejected locally (nothing selected, wrong step)
    #[error("cannot confirm mapping: {reason}")]
    ConfirmationInvalid { reason: String },

    /// An explicit selection names an endpoint that was not discovered
    #[error("endpoint {rest_base} was not discovered on this site")]
    UnknownEndpoint { rest_base: String },

    /// A discovery, confirmation or disconnect is already pending
    #[error("another operation is already in progress ({step})")]
    OperationInFlight { step: StepKind },

    /// The requested action does not apply to the current step
    #[error("cannot {action} while {step}")]
    InvalidTransition { step: StepKind, action: &'static str },

    /// The in-flight operation was cancelled before its result was applied
    #[error("operation cancelled")]
    Cancelled,

    /// No saved connection
    #[error("no site is connected")]
    NotConnected,

    /// Import collaborator failed for one role
    #[error("{role} sync failed: {reason}")]
    SyncFailed { role: Role, reason: String },

    /// A sync for this role is already running
    #[error("a {role} sync is already running")]
    SyncInProgress { role: Role },

    /// The role has no endpoint mapped ("don't sync")
    #[error("{role} sync is turned off for this connection")]
    SyncDisabled { role: Role },

    /// Cascade delete requested without the typed confirmation
    #[error("deleting synced data requires typing the confirmation word")]
    DisconnectCascadeDenied,

    /// A collaborator call exceeded its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    /// Persistence failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ConnectError {
    pub fn confirmation(reason: impl Into<String>) -> Self {
        ConnectError::ConfirmationInvalid {
            reason: reason.into(),
        }
    }

    pub fn storage(error: anyhow::Error) -> Self {
        ConnectError::Storage(error.into())
    }
}
