//! Persisted report rows for maintenance operations.
//!
//! Every administrative operation writes its report before returning, even on
//! partial failure, so operators can see how far it got.

use crate::models::entity::{Entity, FieldValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal status of a maintenance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    Partial,
}

/// Outcome of a rebuild: swap applied or discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStatus {
    Swapped,
    RolledBack,
}

/// Result of a read-only consistency audit over one index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub id: String,
    pub kind: String,
    pub field: String,
    /// Index members whose document no longer exists.
    pub orphaned_members: Vec<String>,
    /// Sampled documents missing from their expected index bucket.
    pub missing_members: Vec<String>,
    /// Fraction of live documents covered by the gap sample.
    pub sample_ratio: f64,
    /// Total memberships in the live index generation.
    pub total_members: u64,
    /// Live documents counted during the scan.
    pub total_documents: u64,
    pub status: ReportStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AuditReport {
    /// Estimated drift percentage, extrapolating sampled gaps to the full
    /// document population.
    pub fn drift_pct(&self) -> f64 {
        if self.total_members == 0 && self.total_documents == 0 {
            return 0.0;
        }
        let extrapolated_gaps = if self.sample_ratio > 0.0 {
            self.missing_members.len() as f64 / self.sample_ratio
        } else {
            self.missing_members.len() as f64
        };
        let drift = self.orphaned_members.len() as f64 + extrapolated_gaps;
        let population = (self.total_members.max(self.total_documents)).max(1) as f64;
        100.0 * drift / population
    }

    /// Whether this audit crosses the caller's drift threshold.
    pub fn exceeds(&self, threshold_pct: f64) -> bool {
        self.drift_pct() > threshold_pct
    }
}

/// Result of a versioned index rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildReport {
    pub id: String,
    pub kind: String,
    pub field: String,
    pub previous_count: u64,
    pub new_count: u64,
    pub verified: bool,
    pub status: RebuildStatus,
    /// Generation the rebuild wrote into.
    pub generation: u64,
    /// Reason verification refused the swap, when rolled back.
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One member of a duplicate group with its merge-priority score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMember {
    pub primary_key: String,
    pub score: i64,
    pub version: u64,
}

/// Entities sharing a natural key that should be unique.
///
/// Members are ordered by merge priority, survivor first. Transient: computed
/// on demand, never persisted beyond the merge record it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub natural_key: String,
    pub members: Vec<ScoredMember>,
}

/// A field two non-survivors disagreed on while the survivor had no value.
///
/// Identity-bearing conflicts are never auto-merged; they are recorded here
/// for manual resolution and the merge proceeds for all other fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConflict {
    pub field: String,
    /// Candidate values keyed by the primary key that carried them.
    pub candidates: BTreeMap<String, FieldValue>,
}

/// Audit record of one duplicate-group merge.
///
/// Carries full snapshots of the removed documents so a merge is explainable
/// and reversible from this record alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: String,
    pub kind: String,
    pub natural_key: String,
    pub survivor: String,
    pub scores: Vec<ScoredMember>,
    /// Fields copied onto the survivor, with the values taken.
    pub merged_fields: BTreeMap<String, FieldValue>,
    pub conflicts: Vec<MergeConflict>,
    /// Snapshots of every removed document, keyed by primary key.
    pub removed: BTreeMap<String, Entity>,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
}
