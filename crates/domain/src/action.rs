//! Command actions and target sets

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Safety-critical actions that require a quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Engage,
    ShutdownUnit,
    ShutdownFleet,
}

impl ActionType {
    pub const ALL: [ActionType; 3] = [
        ActionType::Engage,
        ActionType::ShutdownUnit,
        ActionType::ShutdownFleet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Engage => "ENGAGE",
            ActionType::ShutdownUnit => "SHUTDOWN_UNIT",
            ActionType::ShutdownFleet => "SHUTDOWN_FLEET",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| DomainError::UnknownAction(s.to_string()))
    }
}

/// Who a command addresses, and what it acts on.
///
/// A platform is addressed when it is listed by id, or when its fleet is
/// listed. Designators name the engagement targets and never affect
/// applicability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSet {
    #[serde(default)]
    pub platforms: BTreeSet<String>,
    #[serde(default)]
    pub fleets: BTreeSet<String>,
    #[serde(default)]
    pub designators: BTreeSet<String>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn platform(mut self, platform_id: impl Into<String>) -> Self {
        self.platforms.insert(platform_id.into());
        self
    }

    pub fn fleet(mut self, fleet_id: impl Into<String>) -> Self {
        self.fleets.insert(fleet_id.into());
        self
    }

    pub fn designator(mut self, designator: impl Into<String>) -> Self {
        self.designators.insert(designator.into());
        self
    }

    pub fn addresses_nobody(&self) -> bool {
        self.platforms.is_empty() && self.fleets.is_empty()
    }

    /// Whether the command addresses `platform_id` (directly or by fleet)
    pub fn applies_to(&self, platform_id: &str, fleet_id: Option<&str>) -> bool {
        self.platforms.contains(platform_id)
            || fleet_id.is_some_and(|fleet| self.fleets.contains(fleet))
    }
}
