//! Versioned index rebuilds: build, verify, swap.
//!
//! A rebuild streams live documents into a fresh index generation, verifies
//! the new generation against the live one, and only then swaps the pointer.
//! Readers never see a partially-built index, and a rebuild that looks like
//! data loss rolls back with the live index byte-for-byte untouched. This
//! replaces the delete-then-repopulate pattern, which exposes an empty index
//! mid-rebuild and has no way back when repopulation fails partway.

use crate::db::backup_database_file;
use crate::db::tables::REDB_FILE_NAME;
use crate::error::StoreError;
use crate::models::{Entity, RebuildReport, RebuildStatus};
use crate::store::EntityStore;
use chrono::Utc;
use std::path::Path;
use uuid::Uuid;

const SCAN_PAGE: usize = 256;

/// Advisory lock key serializing maintenance of one index.
pub fn rebuild_lock_key(kind: &str, field: &str) -> String {
    format!("lock:rebuild:{}:{}", kind, field)
}

fn rebuild_cursor_key(kind: &str, field: &str) -> String {
    format!("cursor:rebuild:{}:{}", kind, field)
}

fn rebuild_report_key(kind: &str, report_id: &str) -> String {
    format!("report:{}:rebuild:{}", kind, report_id)
}

/// Count the members of `bucket` whose document still exists.
///
/// Verification compares against live members only: orphaned entries are not
/// data, and removing them is the point of a rebuild.
fn live_member_count(store: &EntityStore, bucket: &str) -> Result<u64, StoreError> {
    let mut count = 0u64;
    for member in store.db.sets.members(bucket)? {
        if store.db.docs.exists(&member)? {
            count += 1;
        }
    }
    Ok(count)
}

/// Rebuild the `(kind, field)` index into a fresh generation.
///
/// State machine: Idle → Building → Verifying → Swapped | RolledBack → Idle.
/// The build is checkpointed per page; a crashed rebuild resumes from its
/// cursor instead of starting over.
///
/// # Returns
/// The persisted [`RebuildReport`]; `status` tells whether the swap happened.
///
/// # Errors
/// - [`StoreError::RebuildInProgress`] when another rebuild holds the lock —
///   fail fast, never block.
/// - [`StoreError::SchemaViolation`] for non-indexed fields.
/// - Storage errors from either store.
pub fn rebuild(store: &EntityStore, kind: &str, field: &str) -> Result<RebuildReport, StoreError> {
    let schema = store.schema(kind)?;
    if !EntityStore::index_fields(schema).iter().any(|f| f == field) {
        return Err(StoreError::SchemaViolation(format!(
            "{}.{} is not an indexed field",
            kind, field
        )));
    }

    let guard = store
        .db
        .locks
        .acquire(
            &rebuild_lock_key(kind, field),
            store.config.rebuild_lock_ttl_ms,
            "rebuild",
        )
        .map_err(|err| match err {
            StoreError::LockContention { .. } => StoreError::RebuildInProgress {
                index: format!("{}:{}", kind, field),
            },
            other => other,
        })?;

    if store.config.auto_backup {
        let db_file = Path::new(&store.config.db_path).join(REDB_FILE_NAME);
        backup_database_file(&db_file.to_string_lossy())?;
    }

    let started_at = Utc::now();
    let pointer = store.index.generation_pointer(kind, field)?;
    let live_gen = pointer.live;
    let new_gen = pointer
        .backups
        .iter()
        .map(|backup| backup.generation)
        .chain([live_gen])
        .max()
        .unwrap_or(0)
        + 1;

    // Building. A leftover cursor means a previous attempt died mid-build:
    // keep its partial buckets (adds are idempotent) and continue after the
    // cursor. Otherwise clear any stale buckets in the target generation.
    let cursor_key = rebuild_cursor_key(kind, field);
    let mut cursor: Option<String> = store.db.docs.get(&cursor_key)?;
    if cursor.is_none() {
        store.index.clear_generation(kind, field, new_gen)?;
    }
    loop {
        let page = store
            .db
            .docs
            .scan_keys(&schema.key_prefix, cursor.as_deref(), SCAN_PAGE)?;
        for key in &page.keys {
            let Some(entity) = store.db.docs.get::<Entity>(key)? else {
                continue;
            };
            if let Some(value) = schema.indexed_value(&entity, field) {
                let bucket = crate::index::bucket_key(kind, field, new_gen, value);
                store.db.sets.add(&bucket, key)?;
            }
        }
        match page.next_cursor {
            Some(next) => {
                store.db.docs.set(&cursor_key, &next)?;
                cursor = Some(next);
            }
            None => break,
        }
    }

    // Verifying: no live bucket may shrink by more than the tolerance.
    let mut previous_count = 0u64;
    for (_, bucket) in store.index.buckets(kind, field, live_gen)? {
        previous_count += store.db.sets.cardinality(&bucket)?;
    }
    let mut verification_error: Option<StoreError> = None;
    for (value, bucket) in store.index.buckets(kind, field, live_gen)? {
        let old_live = live_member_count(store, &bucket)?;
        if old_live == 0 {
            continue;
        }
        let new_bucket = crate::index::bucket_key(kind, field, new_gen, &value);
        let new_count = store.db.sets.cardinality(&new_bucket)?;
        let floor = old_live as f64 * (1.0 - store.config.rebuild_tolerance_pct / 100.0);
        if (new_count as f64) < floor {
            verification_error = Some(StoreError::RebuildVerificationFailed {
                index: format!("{}:{}", kind, field),
                reason: format!(
                    "bucket '{}' shrank from {} live member(s) to {}",
                    value, old_live, new_count
                ),
            });
            break;
        }
    }

    let mut new_count = 0u64;
    for (_, bucket) in store.index.buckets(kind, field, new_gen)? {
        new_count += store.db.sets.cardinality(&bucket)?;
    }

    let report_id = format!("{}-{}", started_at.timestamp_millis(), Uuid::new_v4());
    if let Some(err) = verification_error {
        // RolledBack: discard the new generation; the live index is untouched.
        tracing::warn!("Rebuild of {}:{} rolled back: {}", kind, field, err);
        store.index.clear_generation(kind, field, new_gen)?;
        store.db.docs.delete(&cursor_key)?;

        let report = RebuildReport {
            id: report_id,
            kind: kind.to_string(),
            field: field.to_string(),
            previous_count,
            new_count,
            verified: false,
            status: RebuildStatus::RolledBack,
            generation: new_gen,
            failure_reason: Some(err.to_string()),
            started_at,
            finished_at: Utc::now(),
        };
        store
            .db
            .docs
            .set(&rebuild_report_key(kind, &report.id), &report)?;
        drop(guard);
        return Ok(report);
    }

    // Swapped: one pointer write makes the new generation live; the prior
    // generation stays behind as a timestamped backup until retention prunes
    // it, so recovery is a pointer write, not a restore.
    let pruned = store
        .index
        .swap_generation(kind, field, new_gen, store.config.backup_retention)?;
    for generation in pruned {
        let removed = store.index.clear_generation(kind, field, generation)?;
        tracing::debug!(
            "Pruned retired generation g{} of {}:{} ({} membership(s))",
            generation,
            kind,
            field,
            removed
        );
    }
    store.db.docs.delete(&cursor_key)?;

    let report = RebuildReport {
        id: report_id,
        kind: kind.to_string(),
        field: field.to_string(),
        previous_count,
        new_count,
        verified: true,
        status: RebuildStatus::Swapped,
        generation: new_gen,
        failure_reason: None,
        started_at,
        finished_at: Utc::now(),
    };
    store
        .db
        .docs
        .set(&rebuild_report_key(kind, &report.id), &report)?;
    tracing::debug!(
        "Rebuilt {}:{} into g{}: {} -> {} membership(s)",
        kind,
        field,
        new_gen,
        report.previous_count,
        report.new_count
    );
    drop(guard);
    Ok(report)
}
