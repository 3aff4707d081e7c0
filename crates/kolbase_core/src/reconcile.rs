//! Duplicate reconciliation: detect entities sharing a natural key, merge
//! them into one survivor, and remove the rest plus their index footprints.
//!
//! Merges are explainable and reversible: the full snapshots of every removed
//! document are persisted in a merge record before anything is deleted.

use crate::db::backup_database_file;
use crate::db::tables::REDB_FILE_NAME;
use crate::error::StoreError;
use crate::identity::{is_canonical_key, is_invalid_key_suffix};
use crate::models::{
    DuplicateGroup, Entity, FieldValue, KindSchema, MergeConflict, MergeRecord, ReportStatus,
    ScoredMember,
};
use crate::store::EntityStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

const SCAN_PAGE: usize = 256;

// Canonical merge-priority weights. The source repair passes disagreed on
// these; this table is the single policy, kept together for review.
const SCORE_APPROVED: i64 = 1000;
const SCORE_PENDING: i64 = 100;
const SCORE_REJECTED: i64 = 10;
const ROLE_WEIGHTS: [(&str, i64); 5] = [
    ("admin", 500),
    ("core", 400),
    ("team", 300),
    ("kol", 200),
    ("user", 100),
];
const SCORE_CANONICAL_KEY: i64 = 150;
const SCORE_IDENTITY_FIELD: i64 = 25;
const SCORE_OPTIONAL_FIELD: i64 = 10;
const RECENCY_MAX: i64 = 100;

/// Record of a document removed by the invalid-key sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SweepRecord {
    key: String,
    entity: Option<Entity>,
    created_at: DateTime<Utc>,
}

fn reconcile_cursor_key(kind: &str) -> String {
    format!("cursor:reconcile:{}", kind)
}

fn merge_record_key(kind: &str, record_id: &str) -> String {
    format!("report:{}:merge:{}", kind, record_id)
}

fn sweep_record_key(kind: &str, doc_key: &str) -> String {
    format!("report:{}:sweep:{}", kind, doc_key)
}

/// Merge-priority score for one entity.
///
/// Higher wins: approval status, role, canonical key format, linked identity
/// fields, field population, and recency, in that order of weight.
pub fn score_entity(schema: &KindSchema, entity: &Entity, now: DateTime<Utc>) -> i64 {
    let mut score = 0;

    score += match entity.text_field("approval_status") {
        Some("approved") => SCORE_APPROVED,
        Some("pending") => SCORE_PENDING,
        Some("rejected") => SCORE_REJECTED,
        _ => 0,
    };

    if let Some(role) = entity.text_field("role") {
        score += ROLE_WEIGHTS
            .iter()
            .find(|(name, _)| *name == role)
            .map(|(_, weight)| *weight)
            .unwrap_or(0);
    }

    if let Some(natural) = entity.natural_key(&schema.natural_key_type) {
        if is_canonical_key(schema, &entity.primary_key, natural) {
            score += SCORE_CANONICAL_KEY;
        }
    }

    for (name, value) in &entity.fields {
        if value.is_empty() || name == "role" || name == "approval_status" {
            continue;
        }
        score += if schema.is_identity(name) {
            SCORE_IDENTITY_FIELD
        } else {
            SCORE_OPTIONAL_FIELD
        };
    }

    let days_since_update = (now - entity.updated_at).num_days();
    score += (RECENCY_MAX - days_since_update).clamp(0, RECENCY_MAX);

    score
}

fn scored_member(schema: &KindSchema, entity: &Entity, now: DateTime<Utc>) -> ScoredMember {
    ScoredMember {
        primary_key: entity.primary_key.clone(),
        score: score_entity(schema, entity, now),
        version: entity.version,
    }
}

/// Total, stable ordering: score desc, version desc, primary key asc.
fn sort_by_priority(members: &mut [ScoredMember]) {
    members.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(b.version.cmp(&a.version))
            .then(a.primary_key.cmp(&b.primary_key))
    });
}

/// Scan `kind` and group live entities by normalized natural key.
///
/// # Returns
/// One [`DuplicateGroup`] per natural key with more than one owner, members
/// ordered by merge priority.
///
/// # Errors
/// Returns an error when storage access or deserialization fails.
pub fn find_duplicates(store: &EntityStore, kind: &str) -> Result<Vec<DuplicateGroup>, StoreError> {
    let schema = store.schema(kind)?;
    let now = Utc::now();
    let mut by_natural_key: BTreeMap<String, Vec<ScoredMember>> = BTreeMap::new();

    let mut cursor: Option<String> = None;
    loop {
        let page = store
            .db
            .docs
            .scan_keys(&schema.key_prefix, cursor.as_deref(), SCAN_PAGE)?;
        for key in &page.keys {
            let Some(entity) = store.db.docs.get::<Entity>(key)? else {
                continue;
            };
            let Some(natural) = entity.natural_key(&schema.natural_key_type) else {
                continue;
            };
            by_natural_key
                .entry(natural.to_string())
                .or_default()
                .push(scored_member(schema, &entity, now));
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let mut groups = Vec::new();
    for (natural_key, mut members) in by_natural_key {
        if members.len() < 2 {
            continue;
        }
        sort_by_priority(&mut members);
        groups.push(DuplicateGroup {
            natural_key,
            members,
        });
    }
    Ok(groups)
}

/// Merge one duplicate group into its highest-priority member.
///
/// Field-wise: values present on a non-survivor and absent on the survivor
/// are copied over; populated survivor fields are never overwritten; list
/// fields are unioned; the earliest `created_at` is kept. Identity-bearing
/// fields with disagreeing candidates are flagged, not guessed.
///
/// # Returns
/// The persisted merge record, or `None` when the group no longer has two
/// live members.
///
/// # Errors
/// Returns [`StoreError::LockContention`] when a member's write lock is
/// held, or a storage error.
pub fn merge(
    store: &EntityStore,
    kind: &str,
    group: &DuplicateGroup,
) -> Result<Option<MergeRecord>, StoreError> {
    let schema = store.schema(kind)?;
    let now = Utc::now();

    // Lock members in key order so two reconcilers cannot deadlock.
    let mut lock_keys: Vec<String> = group
        .members
        .iter()
        .map(|member| member.primary_key.clone())
        .collect();
    lock_keys.sort();
    let mut guards = Vec::with_capacity(lock_keys.len());
    for key in &lock_keys {
        guards.push(store.db.locks.acquire(
            &crate::store::entity_lock_key(key),
            store.config.rebuild_lock_ttl_ms,
            "reconcile",
        )?);
    }

    // Re-fetch under lock; the scan's view may be stale.
    let mut entities: Vec<Entity> = Vec::new();
    for member in &group.members {
        if let Some(entity) = store.db.docs.get::<Entity>(&member.primary_key)? {
            entities.push(entity);
        }
    }
    if entities.len() < 2 {
        return Ok(None);
    }

    let mut scores: Vec<ScoredMember> = entities
        .iter()
        .map(|entity| scored_member(schema, entity, now))
        .collect();
    sort_by_priority(&mut scores);
    let survivor_key = scores[0].primary_key.clone();

    let mut survivor = entities
        .iter()
        .find(|entity| entity.primary_key == survivor_key)
        .cloned()
        .ok_or(StoreError::NotFound)?;
    let victims: Vec<Entity> = scores[1..]
        .iter()
        .filter_map(|member| {
            entities
                .iter()
                .find(|entity| entity.primary_key == member.primary_key)
                .cloned()
        })
        .collect();

    // Candidate values per field the survivor lacks, in priority order.
    let mut candidates: BTreeMap<String, BTreeMap<String, FieldValue>> = BTreeMap::new();
    let mut merged_fields: BTreeMap<String, FieldValue> = BTreeMap::new();
    let mut conflicts: Vec<MergeConflict> = Vec::new();

    for victim in &victims {
        for (name, value) in &victim.fields {
            if value.is_empty() {
                continue;
            }
            if schema.is_list(name) {
                let mut union: Vec<String> = survivor
                    .fields
                    .get(name)
                    .and_then(FieldValue::as_list)
                    .map(<[String]>::to_vec)
                    .unwrap_or_default();
                let mut grew = false;
                if let Some(items) = value.as_list() {
                    for item in items {
                        if !union.contains(item) {
                            union.push(item.clone());
                            grew = true;
                        }
                    }
                }
                if grew {
                    union.sort();
                    let merged = FieldValue::List(union);
                    survivor.fields.insert(name.clone(), merged.clone());
                    merged_fields.insert(name.clone(), merged);
                }
                continue;
            }

            let survivor_has = survivor
                .fields
                .get(name)
                .map(|existing| !existing.is_empty())
                .unwrap_or(false);
            if survivor_has {
                continue;
            }
            candidates
                .entry(name.clone())
                .or_default()
                .insert(victim.primary_key.clone(), value.clone());
        }
    }

    for (name, field_candidates) in candidates {
        let mut values = field_candidates.values();
        let first = values.next();
        let disagreeing = values.any(|value| Some(value) != first);

        if disagreeing && schema.is_identity(&name) {
            conflicts.push(MergeConflict {
                field: name,
                candidates: field_candidates,
            });
            continue;
        }

        // Agreeing candidates, or a non-identity disagreement: take the
        // highest-priority victim's value.
        let chosen = victims
            .iter()
            .find_map(|victim| field_candidates.get(&victim.primary_key))
            .cloned();
        if let Some(value) = chosen {
            survivor.fields.insert(name.clone(), value.clone());
            merged_fields.insert(name, value);
        }
    }

    for victim in &victims {
        for (key_type, value) in &victim.natural_keys {
            survivor
                .natural_keys
                .entry(key_type.clone())
                .or_insert_with(|| value.clone());
        }
        if victim.created_at < survivor.created_at {
            survivor.created_at = victim.created_at;
        }
    }
    survivor.version += 1;
    survivor.updated_at = now;

    // Persist the record before any destructive step so the merge is
    // recoverable from the audit trail even if it is interrupted.
    let record_id = format!("{}-{}", now.timestamp_millis(), Uuid::new_v4());
    let mut record = MergeRecord {
        id: record_id.clone(),
        kind: kind.to_string(),
        natural_key: group.natural_key.clone(),
        survivor: survivor_key.clone(),
        scores,
        merged_fields,
        conflicts,
        removed: victims
            .iter()
            .map(|victim| (victim.primary_key.clone(), victim.clone()))
            .collect(),
        status: ReportStatus::Partial,
        created_at: now,
    };
    let record_key = merge_record_key(kind, &record_id);
    store.db.docs.set(&record_key, &record)?;

    store.db.docs.set(&survivor.primary_key, &survivor)?;
    store.ensure_index_footprint(schema, &survivor)?;
    store.invalidate_cached(&survivor.primary_key);

    for victim in &victims {
        store.remove_index_footprint(schema, victim)?;
        store.db.docs.delete(&victim.primary_key)?;
        store.invalidate_cached(&victim.primary_key);
    }

    record.status = ReportStatus::Completed;
    store.db.docs.set(&record_key, &record)?;

    if !record.conflicts.is_empty() {
        tracing::warn!(
            "Merge of '{}' ({}) left {} conflicting field(s) for manual resolution",
            record.natural_key,
            kind,
            record.conflicts.len()
        );
    }

    drop(guards);
    Ok(Some(record))
}

/// Delete documents stored under known-bad key suffixes or lacking a usable
/// natural key.
///
/// Each removal is snapshotted to a persisted sweep record first.
///
/// # Returns
/// The removed document keys.
///
/// # Errors
/// Returns an error when storage operations fail.
pub fn sweep_invalid_keys(store: &EntityStore, kind: &str) -> Result<Vec<String>, StoreError> {
    let schema = store.schema(kind)?;
    let mut removed = Vec::new();

    let mut cursor: Option<String> = None;
    loop {
        let page = store
            .db
            .docs
            .scan_keys(&schema.key_prefix, cursor.as_deref(), SCAN_PAGE)?;
        for key in &page.keys {
            let suffix = &key[schema.key_prefix.len()..];
            if !is_invalid_key_suffix(suffix) {
                continue;
            }
            let entity: Option<Entity> = store.db.docs.get(key)?;
            store.db.docs.set(
                &sweep_record_key(kind, key),
                &SweepRecord {
                    key: key.clone(),
                    entity: entity.clone(),
                    created_at: Utc::now(),
                },
            )?;
            if let Some(entity) = &entity {
                store.remove_index_footprint(schema, entity)?;
            }
            store.db.docs.delete(key)?;
            store.invalidate_cached(key);
            tracing::warn!("Swept invalid document key: {}", key);
            removed.push(key.clone());
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(removed)
}

/// Full reconciliation pass: merge every duplicate group, then sweep invalid
/// keys.
///
/// Holds the advisory maintenance lock for each of the kind's indexes so it
/// never interleaves with a rebuild. Progress is checkpointed per group; a
/// resumed run skips groups already merged.
///
/// # Returns
/// The merge records produced by this run.
///
/// # Errors
/// Returns [`StoreError::LockContention`] when a maintenance lock is held,
/// or a storage error. Completed merges stay applied either way.
pub fn run(store: &EntityStore, kind: &str) -> Result<Vec<MergeRecord>, StoreError> {
    let schema = store.schema(kind)?;

    let mut maintenance_guards = Vec::new();
    for field in EntityStore::index_fields(schema) {
        maintenance_guards.push(store.db.locks.acquire(
            &crate::rebuild::rebuild_lock_key(kind, &field),
            store.config.rebuild_lock_ttl_ms,
            "reconcile",
        )?);
    }

    if store.config.auto_backup {
        let db_file = Path::new(&store.config.db_path).join(REDB_FILE_NAME);
        backup_database_file(&db_file.to_string_lossy())?;
    }

    let cursor_key = reconcile_cursor_key(kind);
    let resume_after: Option<String> = store.db.docs.get(&cursor_key)?;

    let groups = find_duplicates(store, kind)?;
    let mut records = Vec::new();
    for group in &groups {
        if let Some(last) = &resume_after {
            if group.natural_key.as_str() <= last.as_str() {
                continue;
            }
        }
        if let Some(record) = merge(store, kind, group)? {
            records.push(record);
        }
        store.db.docs.set(&cursor_key, &group.natural_key)?;
    }

    let swept = sweep_invalid_keys(store, kind)?;
    if !swept.is_empty() {
        tracing::debug!("Reconciliation swept {} invalid key(s)", swept.len());
    }

    store.db.docs.delete(&cursor_key)?;
    store.clear_cache();
    drop(maintenance_guards);
    Ok(records)
}
