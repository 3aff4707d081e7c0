//! Data models for entities, schemas, and maintenance reports.

/// Entity rows, field values, and per-kind schemas.
pub mod entity;
/// Maintenance report rows (audit, rebuild, reconciliation).
pub mod report;

pub use entity::{Entity, FieldValue, KindSchema};
pub use report::{
    AuditReport, DuplicateGroup, MergeConflict, MergeRecord, RebuildReport, RebuildStatus,
    ReportStatus, ScoredMember,
};
