//! Domain enums shared across the api, ledger, and worker crates.
//!
//! All enums map to TEXT columns; Display/FromStr are the single place
//! the string forms live so SQL and serde never disagree.

use serde::{Deserialize, Serialize};

/// Subscription plan tiers offered by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Starter,
    Growth,
    Scale,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Growth => "growth",
            PlanTier::Scale => "scale",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "starter" => Some(PlanTier::Starter),
            "growth" => Some(PlanTier::Growth),
            "scale" => Some(PlanTier::Scale),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Node types in a tenant's organizational hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Location,
    Department,
    Team,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organization",
            EntityKind::Location => "location",
            EntityKind::Department => "department",
            EntityKind::Team => "team",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "organization" => Some(EntityKind::Organization),
            "location" => Some(EntityKind::Location),
            "department" => Some(EntityKind::Department),
            "team" => Some(EntityKind::Team),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_tier_round_trips() {
        for tier in [PlanTier::Starter, PlanTier::Growth, PlanTier::Scale] {
            assert_eq!(PlanTier::from_str(tier.as_str()), Some(tier));
        }
        assert_eq!(PlanTier::from_str("enterprise"), None);
    }

    #[test]
    fn entity_kind_round_trips() {
        for kind in [
            EntityKind::Organization,
            EntityKind::Location,
            EntityKind::Department,
            EntityKind::Team,
        ] {
            assert_eq!(EntityKind::from_str(kind.as_str()), Some(kind));
        }
    }
}
