//! Mapping resolver.
//!
//! Ranks the discovered candidate pool once per role, pre-selects the top
//! candidate as the suggested default, and lets the operator override either
//! role. The resolver never blocks on a role collision; it only reports it.

use serde::{Deserialize, Serialize};

use crate::classifier::{contextual_confidence, ConfidenceBand};
use crate::endpoints::{DiscoveredEndpoint, DiscoveredEndpointSet};
use crate::error::{ConnectError, Result};
use crate::types::{PerRole, Role};

/// One entry of a role ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub endpoint: DiscoveredEndpoint,
    pub confidence: f64,
    pub band: ConfidenceBand,
}

/// What the operator picked for one role.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "rest_base", rename_all = "snake_case")]
pub enum RoleSelection {
    /// No explicit choice; the top-ranked candidate applies
    #[default]
    Suggested,
    /// Operator picked this `rest_base`
    Explicit(String),
    /// Operator chose "don't sync" for this role
    Skip,
}

/// Effective mapping, ready to confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingResolution {
    pub endpoints: PerRole<Option<String>>,
    /// Same endpoint chosen for both roles (warning only)
    pub conflict: bool,
}

/// Rank `candidates` for `role`, highest contextual confidence first.
///
/// `sort_by` is stable, so ties keep discovery order.
pub fn rank_candidates(candidates: &[DiscoveredEndpoint], role: Role) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .iter()
        .map(|endpoint| {
            let confidence = contextual_confidence(endpoint, role);
            RankedCandidate {
                endpoint: endpoint.clone(),
                confidence,
                band: ConfidenceBand::from_confidence(confidence),
            }
        })
        .collect();

    ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    ranked
}

/// Per-role rankings plus the operator's selections for one discovered set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingResolver {
    candidates: Vec<DiscoveredEndpoint>,
    rankings: PerRole<Vec<RankedCandidate>>,
    selections: PerRole<RoleSelection>,
}

impl MappingResolver {
    pub fn new(set: &DiscoveredEndpointSet) -> Self {
        let candidates = set.candidates();
        let rankings = PerRole::from_fn(|role| rank_candidates(&candidates, role));

        Self {
            candidates,
            rankings,
            selections: PerRole::default(),
        }
    }

    pub fn candidates(&self) -> &[DiscoveredEndpoint] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn ranked(&self, role: Role) -> &[RankedCandidate] {
        &self.rankings[role]
    }

    /// Top-ranked candidate, `None` for an empty pool.
    pub fn suggested(&self, role: Role) -> Option<&RankedCandidate> {
        self.rankings[role].first()
    }

    pub fn selection(&self, role: Role) -> &RoleSelection {
        &self.selections[role]
    }

    /// Record the operator's choice for `role`.
    ///
    /// Explicit choices must name a candidate from this pool.
    pub fn select(&mut self, role: Role, selection: RoleSelection) -> Result<()> {
        if let RoleSelection::Explicit(rest_base) = &selection {
            if !self.contains(rest_base) {
                return Err(ConnectError::UnknownEndpoint {
                    rest_base: rest_base.clone(),
                });
            }
        }
        self.selections[role] = selection;
        Ok(())
    }

    pub fn contains(&self, rest_base: &str) -> bool {
        self.candidates.iter().any(|e| e.rest_base == rest_base)
    }

    /// Explicit choice if present, otherwise the suggested default.
    pub fn effective(&self, role: Role) -> Option<&str> {
        match &self.selections[role] {
            RoleSelection::Explicit(rest_base) => Some(rest_base.as_str()),
            RoleSelection::Skip => None,
            RoleSelection::Suggested => self
                .suggested(role)
                .map(|candidate| candidate.endpoint.rest_base.as_str()),
        }
    }

    pub fn has_conflict(&self) -> bool {
        matches!(
            (self.effective(Role::Community), self.effective(Role::Property)),
            (Some(community), Some(property)) if community == property
        )
    }

    /// At least one role resolves to an endpoint.
    pub fn can_confirm(&self) -> bool {
        Role::ALL.iter().any(|role| self.effective(*role).is_some())
    }

    pub fn resolution(&self) -> MappingResolution {
        MappingResolution {
            endpoints: PerRole::from_fn(|role| self.effective(role).map(str::to_string)),
            conflict: self.has_conflict(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::Classification;

    fn scenario_set() -> DiscoveredEndpointSet {
        DiscoveredEndpointSet::from_endpoints(vec![
            DiscoveredEndpoint::new("/community").classified(Classification::Community, 0.9),
            DiscoveredEndpoint::new("/listing").classified(Classification::Home, 0.8),
        ])
    }

    fn order(ranked: &[RankedCandidate]) -> Vec<&str> {
        ranked.iter().map(|c| c.endpoint.rest_base.as_str()).collect()
    }

    #[test]
    fn community_and_listing_scenario() {
        let resolver = MappingResolver::new(&scenario_set());

        let community = resolver.ranked(Role::Community);
        assert_eq!(order(community), vec!["/community", "/listing"]);
        assert!((community[0].confidence - 0.9).abs() < 1e-9);
        assert!((community[1].confidence - 0.1).abs() < 1e-9);

        let property = resolver.ranked(Role::Property);
        assert_eq!(order(property), vec!["/listing", "/community"]);
        assert!((property[0].confidence - 0.8).abs() < 1e-9);
        assert!((property[1].confidence - 0.1).abs() < 1e-9);

        assert_eq!(resolver.effective(Role::Community), Some("/community"));
        assert_eq!(resolver.effective(Role::Property), Some("/listing"));
        assert!(!resolver.has_conflict());
    }

    #[test]
    fn top_candidate_dominates_and_ties_keep_discovery_order() {
        let set = DiscoveredEndpointSet::from_endpoints(vec![
            DiscoveredEndpoint::new("/a"),
            DiscoveredEndpoint::new("/b"),
            DiscoveredEndpoint::new("/c").classified(Classification::Community, 0.35),
            DiscoveredEndpoint::new("/d").classified(Classification::Home, 0.2),
            DiscoveredEndpoint::new("/e"),
        ]);
        let ranked = rank_candidates(&set.candidates(), Role::Community);

        let top = ranked[0].confidence;
        assert!(ranked.iter().all(|c| top >= c.confidence));
        // /c is 0.35 and listed first (community group), then the unknowns at 0.35
        assert_eq!(order(&ranked), vec!["/c", "/a", "/b", "/e", "/d"]);
    }

    #[test]
    fn explicit_selection_overrides_default() {
        let mut resolver = MappingResolver::new(&scenario_set());
        resolver
            .select(Role::Property, RoleSelection::Explicit("/community".into()))
            .unwrap();

        assert_eq!(resolver.effective(Role::Property), Some("/community"));
        assert!(resolver.has_conflict());
        assert!(resolver.can_confirm());
        assert!(resolver.resolution().conflict);
    }

    #[test]
    fn unknown_explicit_selection_is_rejected() {
        let mut resolver = MappingResolver::new(&scenario_set());
        let err = resolver
            .select(Role::Community, RoleSelection::Explicit("/nope".into()))
            .unwrap_err();
        assert!(matches!(err, ConnectError::UnknownEndpoint { .. }));
        assert_eq!(resolver.selection(Role::Community), &RoleSelection::Suggested);
    }

    #[test]
    fn skip_clears_role_and_blocks_only_when_both_empty() {
        let mut resolver = MappingResolver::new(&scenario_set());
        resolver.select(Role::Community, RoleSelection::Skip).unwrap();
        assert_eq!(resolver.effective(Role::Community), None);
        assert!(resolver.can_confirm());

        resolver.select(Role::Property, RoleSelection::Skip).unwrap();
        assert!(!resolver.can_confirm());
    }

    #[test]
    fn empty_pool_has_no_default() {
        let resolver = MappingResolver::new(&DiscoveredEndpointSet::default());
        assert!(resolver.is_empty());
        assert!(resolver.suggested(Role::Community).is_none());
        assert!(!resolver.can_confirm());
    }
}
