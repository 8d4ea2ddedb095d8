//! Discovery output: candidate REST endpoints exposed by a remote site.
//!
//! These values are produced fresh by every discovery call and are never
//! persisted. The wire format is the discovery collaborator's camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::types::Role;

/// The discovery collaborator's global guess of an endpoint's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Community,
    Home,
    Unknown,
}

impl Classification {
    /// The sync role this classification points at, if any.
    pub fn role(&self) -> Option<Role> {
        match self {
            Classification::Community => Some(Role::Community),
            Classification::Home => Some(Role::Property),
            Classification::Unknown => None,
        }
    }
}

/// One custom content type found on the remote site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredEndpoint {
    pub slug: String,
    pub display_name: String,
    pub rest_base: String,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub approximate_post_count: Option<u64>,
}

impl DiscoveredEndpoint {
    pub fn new(rest_base: impl Into<String>) -> Self {
        let rest_base = rest_base.into();
        let slug = rest_base.trim_start_matches('/').to_string();
        Self {
            display_name: slug.clone(),
            slug,
            rest_base,
            classification: None,
            confidence: None,
            signals: Vec::new(),
            approximate_post_count: None,
        }
    }

    pub fn classified(mut self, classification: Classification, confidence: f64) -> Self {
        self.classification = Some(classification);
        self.confidence = Some(confidence);
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Absent classification is read as `Unknown`.
    pub fn classification(&self) -> Classification {
        self.classification.unwrap_or(Classification::Unknown)
    }

    /// Raw collaborator confidence clamped to [0, 1]; absent or NaN reads as 0.
    pub fn raw_confidence(&self) -> f64 {
        match self.confidence {
            Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

/// Discovery output grouped by the collaborator's classification.
///
/// Invariant: every `rest_base` appears at most once across the three groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredEndpointSet {
    #[serde(default)]
    pub community_endpoints: Vec<DiscoveredEndpoint>,
    #[serde(default)]
    pub home_endpoints: Vec<DiscoveredEndpoint>,
    #[serde(default)]
    pub unclassified_endpoints: Vec<DiscoveredEndpoint>,
    #[serde(default = "Utc::now")]
    pub discovered_at: DateTime<Utc>,
}

impl Default for DiscoveredEndpointSet {
    fn default() -> Self {
        Self {
            community_endpoints: Vec::new(),
            home_endpoints: Vec::new(),
            unclassified_endpoints: Vec::new(),
            discovered_at: Utc::now(),
        }
    }
}

impl DiscoveredEndpointSet {
    /// Group a flat list by classification, keeping the first occurrence of
    /// each `rest_base`.
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = DiscoveredEndpoint>) -> Self {
        let mut set = Self::default();
        let mut seen = HashSet::new();

        for endpoint in endpoints {
            if !seen.insert(endpoint.rest_base.clone()) {
                continue;
            }
            match endpoint.classification() {
                Classification::Community => set.community_endpoints.push(endpoint),
                Classification::Home => set.home_endpoints.push(endpoint),
                Classification::Unknown => set.unclassified_endpoints.push(endpoint),
            }
        }

        set
    }

    /// Re-establish the grouping/uniqueness invariants on collaborator output.
    ///
    /// Endpoints filed under the wrong group are moved to the group matching
    /// their classification; duplicate `rest_base`s keep the first occurrence.
    pub fn normalized(self) -> Self {
        let discovered_at = self.discovered_at;
        let mut set = Self::from_endpoints(self.candidates_unchecked());
        set.discovered_at = discovered_at;
        set
    }

    /// Full candidate pool in discovery order (community, home, unclassified),
    /// deduplicated by `rest_base`.
    pub fn candidates(&self) -> Vec<DiscoveredEndpoint> {
        let mut seen = HashSet::new();
        self.iter()
            .filter(|e| seen.insert(e.rest_base.as_str()))
            .cloned()
            .collect()
    }

    fn candidates_unchecked(self) -> impl Iterator<Item = DiscoveredEndpoint> {
        self.community_endpoints
            .into_iter()
            .chain(self.home_endpoints)
            .chain(self.unclassified_endpoints)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredEndpoint> {
        self.community_endpoints
            .iter()
            .chain(self.home_endpoints.iter())
            .chain(self.unclassified_endpoints.iter())
    }

    pub fn find(&self, rest_base: &str) -> Option<&DiscoveredEndpoint> {
        self.iter().find(|e| e.rest_base == rest_base)
    }

    pub fn len(&self) -> usize {
        self.community_endpoints.len() + self.home_endpoints.len() + self.unclassified_endpoints.len()
    }

    /// Site reachable but no custom content types found.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
