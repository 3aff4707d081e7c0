//! Read-only consistency audits: compare index contents against live
//! documents.
//!
//! Orphan detection walks every member of the live index generation and
//! checks document existence. Gap detection samples live documents and checks
//! their expected membership, extrapolating a drift estimate from the sample.
//! Neither pass mutates data or indexes; the only writes are the persisted
//! report and the rotating sample cursor.

use crate::error::StoreError;
use crate::models::{AuditReport, Entity, ReportStatus};
use crate::store::EntityStore;
use chrono::Utc;
use uuid::Uuid;

const SCAN_PAGE: usize = 128;

fn audit_cursor_key(kind: &str, field: &str) -> String {
    format!("cursor:audit:{}:{}", kind, field)
}

fn audit_report_key(kind: &str, report_id: &str) -> String {
    format!("report:{}:audit:{}", kind, report_id)
}

/// Audit the `(kind, field)` index.
///
/// The gap sample resumes after the previous audit's cursor and wraps around,
/// so repeated audits cover the whole document population over time.
///
/// # Returns
/// The persisted [`AuditReport`]. Callers compare [`AuditReport::drift_pct`]
/// against their threshold to decide whether to rebuild.
///
/// # Errors
/// Returns [`StoreError::SchemaViolation`] for non-indexed fields, or a
/// storage error.
pub fn audit(store: &EntityStore, kind: &str, field: &str) -> Result<AuditReport, StoreError> {
    let schema = store.schema(kind)?;
    if !EntityStore::index_fields(schema).iter().any(|f| f == field) {
        return Err(StoreError::SchemaViolation(format!(
            "{}.{} is not an indexed field",
            kind, field
        )));
    }
    let started_at = Utc::now();
    let generation = store.index.live_generation(kind, field)?;

    // Orphan pass: every member of every live bucket.
    let mut orphaned_members = Vec::new();
    let mut total_members = 0u64;
    for (value, bucket) in store.index.buckets(kind, field, generation)? {
        for member in store.db.sets.members(&bucket)? {
            total_members += 1;
            if !store.db.docs.exists(&member)? {
                tracing::debug!(
                    "Orphaned member '{}' in {}:{}='{}'",
                    member,
                    kind,
                    field,
                    value
                );
                orphaned_members.push(member);
            }
        }
    }

    // Gap pass: sample live documents. The sample window starts after the
    // previous audit's cursor and wraps back to where it began, so repeated
    // audits cover the whole population without double-counting.
    let cursor_key = audit_cursor_key(kind, field);
    let initial_cursor: Option<String> = store.db.docs.get(&cursor_key)?;
    let mut cursor = initial_cursor.clone();
    let mut wrapped = initial_cursor.is_none();
    let total_documents = store.db.docs.count_prefix(&schema.key_prefix)?;
    let mut missing_members = Vec::new();
    let mut sampled = 0u64;
    let mut done = false;

    while !done && (sampled as usize) < store.config.audit_sample_size {
        let page = store
            .db
            .docs
            .scan_keys(&schema.key_prefix, cursor.as_deref(), SCAN_PAGE)?;
        if page.keys.is_empty() {
            if wrapped {
                break;
            }
            cursor = None;
            wrapped = true;
            continue;
        }
        for key in &page.keys {
            if (sampled as usize) >= store.config.audit_sample_size {
                done = true;
                break;
            }
            if wrapped {
                if let Some(stop) = &initial_cursor {
                    if key.as_str() > stop.as_str() {
                        done = true;
                        break;
                    }
                }
            }
            cursor = Some(key.clone());
            let Some(entity) = store.db.docs.get::<Entity>(key)? else {
                continue;
            };
            sampled += 1;
            let Some(value) = schema.indexed_value(&entity, field) else {
                continue;
            };
            let bucket = crate::index::bucket_key(kind, field, generation, value);
            if !store.db.sets.contains(&bucket, key)? {
                tracing::debug!("Missing membership: '{}' not in {}", key, bucket);
                missing_members.push(key.clone());
            }
        }
        if !done && page.next_cursor.is_none() {
            if wrapped {
                break;
            }
            cursor = None;
            wrapped = true;
        }
    }
    store
        .db
        .docs
        .set(&cursor_key, &cursor.unwrap_or_default())?;

    let sample_ratio = if total_documents == 0 {
        1.0
    } else {
        (sampled as f64 / total_documents as f64).min(1.0)
    };

    let report = AuditReport {
        id: format!("{}-{}", started_at.timestamp_millis(), Uuid::new_v4()),
        kind: kind.to_string(),
        field: field.to_string(),
        orphaned_members,
        missing_members,
        sample_ratio,
        total_members,
        total_documents,
        status: ReportStatus::Completed,
        started_at,
        finished_at: Utc::now(),
    };
    store
        .db
        .docs
        .set(&audit_report_key(kind, &report.id), &report)?;

    tracing::debug!(
        "Audit of {}:{}: {} orphan(s), {} gap(s) in a {:.0}% sample, drift {:.2}%",
        kind,
        field,
        report.orphaned_members.len(),
        report.missing_members.len(),
        100.0 * report.sample_ratio,
        report.drift_pct()
    );
    Ok(report)
}
