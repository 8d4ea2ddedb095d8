use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

// ============================================================================
// ENUMS (type-safe states)
// ============================================================================

/// The two feeds a connection can sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Location records (communities, buildings, campuses)
    Community,
    /// Listing records (units, homes for sale or rent)
    Property,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Community, Role::Property];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Community => "community",
            Role::Property => "property",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "community" | "communities" => Ok(Role::Community),
            // the remote collaborators call listings "home"
            "property" | "properties" | "home" | "homes" => Ok(Role::Property),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Cadence for automatic syncs of one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncInterval {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "hourly_1")]
    Hourly1,
    #[serde(rename = "hourly_2")]
    Hourly2,
    #[serde(rename = "hourly_3")]
    Hourly3,
    #[serde(rename = "hourly_4")]
    Hourly4,
    #[serde(rename = "hourly_6")]
    Hourly6,
    #[serde(rename = "hourly_8")]
    Hourly8,
    #[serde(rename = "hourly_12")]
    Hourly12,
    #[default]
    #[serde(rename = "daily")]
    Daily,
}

impl SyncInterval {
    pub const ALL: [SyncInterval; 9] = [
        SyncInterval::Manual,
        SyncInterval::Hourly1,
        SyncInterval::Hourly2,
        SyncInterval::Hourly3,
        SyncInterval::Hourly4,
        SyncInterval::Hourly6,
        SyncInterval::Hourly8,
        SyncInterval::Hourly12,
        SyncInterval::Daily,
    ];

    /// Time between automatic syncs, `None` for manual-only roles.
    pub fn period(&self) -> Option<Duration> {
        let hours = match self {
            SyncInterval::Manual => return None,
            SyncInterval::Hourly1 => 1,
            SyncInterval::Hourly2 => 2,
            SyncInterval::Hourly3 => 3,
            SyncInterval::Hourly4 => 4,
            SyncInterval::Hourly6 => 6,
            SyncInterval::Hourly8 => 8,
            SyncInterval::Hourly12 => 12,
            SyncInterval::Daily => 24,
        };
        Some(Duration::hours(hours))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncInterval::Manual => "manual",
            SyncInterval::Hourly1 => "hourly_1",
            SyncInterval::Hourly2 => "hourly_2",
            SyncInterval::Hourly3 => "hourly_3",
            SyncInterval::Hourly4 => "hourly_4",
            SyncInterval::Hourly6 => "hourly_6",
            SyncInterval::Hourly8 => "hourly_8",
            SyncInterval::Hourly12 => "hourly_12",
            SyncInterval::Daily => "daily",
        }
    }

    /// Operator-facing label
    pub fn label(&self) -> String {
        match self {
            SyncInterval::Manual => "Manual only".to_string(),
            SyncInterval::Hourly1 => "Every hour".to_string(),
            SyncInterval::Daily => "Daily".to_string(),
            other => {
                let hours = other.period().map(|d| d.num_hours()).unwrap_or_default();
                format!("Every {} hours", hours)
            }
        }
    }
}

impl fmt::Display for SyncInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncInterval::ALL
            .into_iter()
            .find(|interval| interval.as_str() == s.trim())
            .ok_or_else(|| format!("unknown sync interval: {}", s))
    }
}

/// How the import collaborator turns remote posts into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    #[default]
    Standard,
    Ai,
}

impl ExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMode::Standard => "standard",
            ExtractionMode::Ai => "ai",
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "standard" => Ok(ExtractionMode::Standard),
            "ai" => Ok(ExtractionMode::Ai),
            other => Err(format!("unknown extraction mode: {}", other)),
        }
    }
}

// ============================================================================
// ROLE-INDEXED STORAGE
// ============================================================================

/// One value per [`Role`].
///
/// Community and property bookkeeping go through the same code paths,
/// parameterized by role, instead of parallel `community_*` / `home_*` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PerRole<T> {
    pub community: T,
    pub property: T,
}

impl<T> PerRole<T> {
    pub fn new(community: T, property: T) -> Self {
        Self {
            community,
            property,
        }
    }

    pub fn from_fn(mut f: impl FnMut(Role) -> T) -> Self {
        Self {
            community: f(Role::Community),
            property: f(Role::Property),
        }
    }

    pub fn get(&self, role: Role) -> &T {
        match role {
            Role::Community => &self.community,
            Role::Property => &self.property,
        }
    }

    pub fn get_mut(&mut self, role: Role) -> &mut T {
        match role {
            Role::Community => &mut self.community,
            Role::Property => &mut self.property,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &T)> {
        [(Role::Community, &self.community), (Role::Property, &self.property)].into_iter()
    }

    pub fn map<U>(self, mut f: impl FnMut(Role, T) -> U) -> PerRole<U> {
        PerRole {
            community: f(Role::Community, self.community),
            property: f(Role::Property, self.property),
        }
    }
}

impl<T> Index<Role> for PerRole<T> {
    type Output = T;

    fn index(&self, role: Role) -> &T {
        self.get(role)
    }
}

impl<T> IndexMut<Role> for PerRole<T> {
    fn index_mut(&mut self, role: Role) -> &mut T {
        self.get_mut(role)
    }
}
