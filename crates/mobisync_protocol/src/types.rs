//! Enumerations shared by every message.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain record types that participate in sync.
///
/// Each type has its own versioned entity store on the server. The canonical
/// wire name is the lowercase singular (`payment`); the plural form is
/// accepted on input because clients commonly address data types that way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// Payment records.
    #[serde(alias = "payments")]
    Payment,
    /// Inventory items.
    #[serde(alias = "inventories")]
    Inventory,
    /// Logistics events.
    #[serde(alias = "logistics_events")]
    Logistics,
    /// Bonus records.
    #[serde(alias = "bonuses")]
    Bonus,
    /// Analytics snapshots.
    #[serde(alias = "analytics_snapshots")]
    Analytics,
}

impl EntityType {
    /// Every entity type, in canonical order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Payment,
        EntityType::Inventory,
        EntityType::Logistics,
        EntityType::Bonus,
        EntityType::Analytics,
    ];

    /// Returns the canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Payment => "payment",
            EntityType::Inventory => "inventory",
            EntityType::Logistics => "logistics",
            EntityType::Bonus => "bonus",
            EntityType::Analytics => "analytics",
        }
    }

    /// Parses a data type selector.
    ///
    /// `"all"` expands to every type; anything else must name a single type.
    pub fn parse_selector(selector: &str) -> ProtocolResult<Vec<EntityType>> {
        if selector.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::ALL.to_vec());
        }
        selector.parse().map(|t| vec![t])
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "payment" | "payments" => Ok(EntityType::Payment),
            "inventory" | "inventories" => Ok(EntityType::Inventory),
            "logistics" | "logistics_events" => Ok(EntityType::Logistics),
            "bonus" | "bonuses" => Ok(EntityType::Bonus),
            "analytics" | "analytics_snapshots" => Ok(EntityType::Analytics),
            _ => Err(ProtocolError::UnknownEntityType(s.to_string())),
        }
    }
}

/// What a pushed item asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Create a new entity; the server assigns the id.
    Create,
    /// Replace the data of an existing entity.
    Update,
    /// Tombstone an existing entity.
    Delete,
    /// Acknowledge state the client already holds. Never touches the store.
    Sync,
}

impl SyncAction {
    /// Returns true if the action mutates an existing entity.
    pub fn is_mutation(&self) -> bool {
        matches!(self, SyncAction::Update | SyncAction::Delete)
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
            SyncAction::Sync => "sync",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Recorded but not yet picked up.
    Pending,
    /// Currently being worked on.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl JobStatus {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// The data types a sync job covers: one entity type or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum JobScope {
    /// Every entity type.
    All,
    /// A single entity type.
    Type(EntityType),
}

impl JobScope {
    /// Builds the scope covering the given types.
    pub fn covering(types: &[EntityType]) -> Self {
        match types {
            [single] => JobScope::Type(*single),
            _ => JobScope::All,
        }
    }
}

impl fmt::Display for JobScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobScope::All => f.write_str("all"),
            JobScope::Type(t) => t.fmt(f),
        }
    }
}

impl FromStr for JobScope {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(JobScope::All)
        } else {
            s.parse().map(JobScope::Type)
        }
    }
}

impl From<JobScope> for String {
    fn from(scope: JobScope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for JobScope {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Whether a conflict still awaits a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    /// Awaiting resolution.
    Pending,
    /// A resolution has been applied.
    Resolved,
}

/// Strategy used to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the server's data; the client's submission is discarded.
    UseServer,
    /// Apply the client's submission as a new version.
    UseClient,
    /// Apply caller-supplied merged data, or the default field-wise merge.
    Merge,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::UseServer => "use_server",
            Resolution::UseClient => "use_client",
            Resolution::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// Coarse health bucket derived from a device's job success ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncHealth {
    /// At least 95% of finished jobs completed.
    Excellent,
    /// At least 80%.
    Good,
    /// At least 60%.
    Fair,
    /// Below 60%.
    Poor,
    /// No finished jobs yet.
    Unknown,
}

impl SyncHealth {
    /// Buckets `completed / (completed + failed)`.
    pub fn from_counts(completed: u64, failed: u64) -> Self {
        let finished = completed + failed;
        if finished == 0 {
            return SyncHealth::Unknown;
        }
        // Integer percentages keep the thresholds exact.
        let percent = completed * 100 / finished;
        match percent {
            95.. => SyncHealth::Excellent,
            80..=94 => SyncHealth::Good,
            60..=79 => SyncHealth::Fair,
            _ => SyncHealth::Poor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_aliases() {
        assert_eq!("payments".parse::<EntityType>().unwrap(), EntityType::Payment);
        assert_eq!("Inventory".parse::<EntityType>().unwrap(), EntityType::Inventory);
        assert_eq!("bonuses".parse::<EntityType>().unwrap(), EntityType::Bonus);
        assert!("widgets".parse::<EntityType>().is_err());

        let parsed: EntityType = serde_json::from_str("\"payments\"").unwrap();
        assert_eq!(parsed, EntityType::Payment);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"payment\"");
    }

    #[test]
    fn selector_all_expands() {
        assert_eq!(EntityType::parse_selector("all").unwrap().len(), 5);
        assert_eq!(
            EntityType::parse_selector("logistics").unwrap(),
            vec![EntityType::Logistics]
        );
    }

    #[test]
    fn job_scope_as_string() {
        assert_eq!(serde_json::to_string(&JobScope::All).unwrap(), "\"all\"");
        let scope: JobScope = serde_json::from_str("\"bonus\"").unwrap();
        assert_eq!(scope, JobScope::Type(EntityType::Bonus));
        assert_eq!(JobScope::covering(&EntityType::ALL), JobScope::All);
    }

    #[test]
    fn health_thresholds() {
        assert_eq!(SyncHealth::from_counts(0, 0), SyncHealth::Unknown);
        assert_eq!(SyncHealth::from_counts(95, 5), SyncHealth::Excellent);
        assert_eq!(SyncHealth::from_counts(94, 6), SyncHealth::Good);
        assert_eq!(SyncHealth::from_counts(8, 2), SyncHealth::Good);
        assert_eq!(SyncHealth::from_counts(3, 2), SyncHealth::Fair);
        assert_eq!(SyncHealth::from_counts(1, 1), SyncHealth::Poor);
    }

    #[test]
    fn resolution_wire_names() {
        assert_eq!(
            serde_json::to_string(&Resolution::UseClient).unwrap(),
            "\"use_client\""
        );
        let r: Resolution = serde_json::from_str("\"merge\"").unwrap();
        assert_eq!(r, Resolution::Merge);
    }
}
