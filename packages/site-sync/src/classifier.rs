//! Contextual classifier.
//!
//! The discovery collaborator hands back a single global classification per
//! endpoint. Mapping needs two answers ("how good is this as a community
//! feed?" and "how good is this as a property feed?"), so every endpoint is
//! re-scored once per role here.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::endpoints::{Classification, DiscoveredEndpoint};
use crate::types::Role;

/// Score given to endpoints the collaborator could not classify.
pub const UNKNOWN_CONFIDENCE: f64 = 0.35;

/// Opposite-role scores start here and shrink as the collaborator grows more
/// sure of the other role.
pub const OPPOSITE_ROLE_CEILING: f64 = 0.3;

/// Opposite-role scores never drop below this.
pub const OPPOSITE_ROLE_FLOOR: f64 = 0.1;

/// Role-specific confidence for `endpoint`, always in [0, 1].
pub fn contextual_confidence(endpoint: &DiscoveredEndpoint, role: Role) -> f64 {
    let raw = endpoint.raw_confidence();

    match endpoint.classification() {
        Classification::Unknown => UNKNOWN_CONFIDENCE,
        classification if classification.role() == Some(role) => raw,
        _ => OPPOSITE_ROLE_FLOOR.max(OPPOSITE_ROLE_CEILING - raw * OPPOSITE_ROLE_CEILING),
    }
}

/// Display banding for a contextual confidence.
///
/// Presentation only: ranking and selection work on the raw number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    High,
    Possible,
    Low,
}

impl ConfidenceBand {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.7 {
            ConfidenceBand::High
        } else if confidence >= 0.4 {
            ConfidenceBand::Possible
        } else {
            ConfidenceBand::Low
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "high match",
            ConfidenceBand::Possible => "possible match",
            ConfidenceBand::Low => "low match",
        }
    }
}

impl fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
