use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of a tenant's migration history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub description: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// A canonical migration not yet applied to a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigration {
    pub version: i64,
    pub description: String,
}

/// Migration state of one tenant relative to the canonical set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub up_to_date: bool,
    /// Missing canonical migrations in ascending version order
    pub pending: Vec<PendingMigration>,
    /// Latest applied migration
    pub current: Option<MigrationRecord>,
    /// Applied versions that are not part of the canonical set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_versions: Vec<i64>,
    /// Applied versions whose checksum differs from the canonical script
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checksum_mismatches: Vec<i64>,
}

impl MigrationStatus {
    pub fn current_version(&self) -> Option<i64> {
        self.current.as_ref().map(|record| record.version)
    }

    pub fn pending_versions(&self) -> Vec<i64> {
        self.pending.iter().map(|p| p.version).collect()
    }
}
