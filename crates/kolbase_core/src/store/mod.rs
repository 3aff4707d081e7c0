//! Entity store: the write/read facade over documents, indexes, and locks.
//!
//! Every write resolves identity deterministically, serializes on a per-key
//! TTL lock, lands the document, then maintains each affected index. An index
//! update that keeps failing is queued for repair instead of being ignored or
//! rolled back: the document write stays visible and the caller is told the
//! result is eventually consistent.

/// Read-through entity cache.
pub mod cache;

use crate::config::Config;
use crate::db::tables::REDB_FILE_NAME;
use crate::db::Database;
use crate::error::StoreError;
use crate::identity::{normalize_natural_key, resolve_primary_key};
use crate::index::IndexManager;
use crate::models::{AuditReport, DuplicateGroup, Entity, FieldValue, KindSchema, MergeRecord, RebuildReport};
use crate::store::cache::EntityCache;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};

/// Pending index repair queued after a document write outlived its index
/// update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRow {
    pub kind: String,
    pub primary_key: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub queued_at: DateTime<Utc>,
}

/// Marker written before an entity's erase so an interrupted delete can be
/// finished instead of leaving index memberships behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TombstoneRow {
    pub entity: Entity,
    pub created_at: DateTime<Utc>,
}

/// Result of a `put`.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub entity: Entity,
    /// Whether this write created the entity.
    pub created: bool,
    /// The document landed but at least one index update was queued for
    /// repair; index-backed reads may lag briefly.
    pub eventually_consistent: bool,
}

/// Counts from a repair pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairSummary {
    pub repaired_indexes: usize,
    pub finished_deletes: usize,
}

/// Per-entity write lock key.
pub(crate) fn entity_lock_key(primary_key: &str) -> String {
    format!("lock:entity:{}", primary_key)
}

fn repair_key(kind: &str, primary_key: &str, field: &str) -> String {
    format!("repair:{}:{}:{}", kind, primary_key, field)
}

fn repair_prefix(kind: &str) -> String {
    format!("repair:{}:", kind)
}

fn tombstone_key(primary_key: &str) -> String {
    format!("tombstone:{}", primary_key)
}

#[cfg(test)]
static INDEX_FAILPOINT_REMAINING: AtomicU32 = AtomicU32::new(0);

/// Arm the index-write failpoint: the next `failures` index updates fail as
/// if storage were down. Test-only.
#[cfg(test)]
pub(crate) fn set_index_failpoint(failures: u32) {
    INDEX_FAILPOINT_REMAINING.store(failures, Ordering::SeqCst);
}

#[cfg(test)]
fn index_failpoint_trips() -> bool {
    loop {
        let remaining = INDEX_FAILPOINT_REMAINING.load(Ordering::SeqCst);
        if remaining == 0 {
            return false;
        }
        if INDEX_FAILPOINT_REMAINING
            .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

#[cfg(not(test))]
fn index_failpoint_trips() -> bool {
    false
}

/// The storage layer's public facade.
pub struct EntityStore {
    pub(crate) db: Database,
    pub(crate) config: Config,
    pub(crate) index: IndexManager,
    schemas: BTreeMap<String, KindSchema>,
    cache: EntityCache,
}

impl EntityStore {
    /// Open the store at the configured path with the built-in schemas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open(config: Config) -> Result<Self, StoreError> {
        let db_file = Path::new(&config.db_path).join(REDB_FILE_NAME);
        let db = Database::new(&db_file.to_string_lossy())?;
        Ok(Self::with_database(db, config))
    }

    /// Build a store over an existing database handle.
    pub fn with_database(db: Database, config: Config) -> Self {
        let index = IndexManager::new(db.docs.clone(), db.sets.clone());
        let cache = EntityCache::new(
            Duration::from_millis(config.cache_ttl_ms),
            config.cache_capacity,
        );
        let mut schemas = BTreeMap::new();
        for schema in [KindSchema::user(), KindSchema::message()] {
            schemas.insert(schema.kind.clone(), schema);
        }
        Self {
            db,
            config,
            index,
            schemas,
            cache,
        }
    }

    /// Register an additional entity kind.
    pub fn register_schema(&mut self, schema: KindSchema) {
        self.schemas.insert(schema.kind.clone(), schema);
    }

    /// Schema for `kind`.
    ///
    /// # Errors
    /// Returns [`StoreError::SchemaViolation`] for unregistered kinds.
    pub fn schema(&self, kind: &str) -> Result<&KindSchema, StoreError> {
        self.schemas
            .get(kind)
            .ok_or_else(|| StoreError::SchemaViolation(format!("unknown entity kind '{}'", kind)))
    }

    /// Every field of `schema` maintained as an index, natural key first.
    pub(crate) fn index_fields(schema: &KindSchema) -> Vec<String> {
        let mut fields = vec![schema.natural_key_type.clone()];
        for field in &schema.indexed_fields {
            if !fields.contains(field) {
                fields.push(field.clone());
            }
        }
        fields
    }

    /// Upsert an entity by natural key.
    ///
    /// # Arguments
    /// - `kind`: Registered entity kind.
    /// - `natural_key`: Raw natural key, normalized internally.
    /// - `fields`: Field values to apply; present fields overwrite, absent
    ///   fields are retained.
    ///
    /// # Returns
    /// The written entity plus creation and consistency flags.
    ///
    /// # Errors
    /// - [`StoreError::InvalidKey`] for empty natural keys.
    /// - [`StoreError::SchemaViolation`] for unknown kinds or ill-shaped fields.
    /// - [`StoreError::LockContention`] when the per-key write lock is held;
    ///   retry with backoff.
    pub fn put(
        &self,
        kind: &str,
        natural_key: &str,
        fields: BTreeMap<String, FieldValue>,
    ) -> Result<PutOutcome, StoreError> {
        let schema = self.schema(kind)?;
        schema.validate(&fields)?;
        let normalized = normalize_natural_key(natural_key)?;
        let primary_key = resolve_primary_key(schema, natural_key)?;

        let _guard = self.db.locks.acquire(
            &entity_lock_key(&primary_key),
            self.config.write_lock_ttl_ms,
            "put",
        )?;

        let existing: Option<Entity> = self.db.docs.get(&primary_key)?;
        let created = existing.is_none();
        let now = Utc::now();

        let mut entity = existing.clone().unwrap_or_else(|| Entity {
            primary_key: primary_key.clone(),
            kind: kind.to_string(),
            natural_keys: BTreeMap::new(),
            fields: BTreeMap::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        });
        entity
            .natural_keys
            .insert(schema.natural_key_type.clone(), normalized);
        for (name, value) in fields {
            entity.fields.insert(name, value);
        }
        entity.version += 1;
        entity.updated_at = now;

        // Membership moves implied by this write, computed before the
        // document lands so old values come from the stored row.
        let mut moves = Vec::new();
        for field in Self::index_fields(schema) {
            let old_value = existing
                .as_ref()
                .and_then(|e| schema.indexed_value(e, &field))
                .map(str::to_string);
            let new_value = schema.indexed_value(&entity, &field).map(str::to_string);
            if old_value != new_value {
                moves.push((field, old_value, new_value));
            }
        }

        self.db.docs.set(&primary_key, &entity)?;

        let mut eventually_consistent = false;
        for (field, old_value, new_value) in moves {
            let result = if index_failpoint_trips() {
                Err(StoreError::IndexWriteFailed {
                    index: format!("{}:{}", kind, field),
                    reason: "injected failure".to_string(),
                })
            } else {
                self.index.move_member(
                    kind,
                    &field,
                    old_value.as_deref(),
                    new_value.as_deref(),
                    &primary_key,
                )
            };

            if let Err(err) = result {
                tracing::warn!(
                    "Index update failed for {} field '{}' on '{}': {}; queueing repair",
                    kind,
                    field,
                    primary_key,
                    err
                );
                let row = RepairRow {
                    kind: kind.to_string(),
                    primary_key: primary_key.clone(),
                    field: field.clone(),
                    old_value,
                    new_value,
                    queued_at: now,
                };
                self.db
                    .docs
                    .set(&repair_key(kind, &primary_key, &field), &row)?;
                eventually_consistent = true;
            }
        }

        self.cache.insert(entity.clone());
        Ok(PutOutcome {
            entity,
            created,
            eventually_consistent,
        })
    }

    /// Fetch an entity by natural key.
    ///
    /// Falls back to the natural-key index for entities that survived a merge
    /// under a legacy primary key.
    ///
    /// # Returns
    /// `Ok(Some(entity))` when found, `Ok(None)` on a read miss — a valid
    /// outcome, distinct from storage errors.
    ///
    /// # Errors
    /// Returns an error when the key is invalid or storage access fails.
    pub fn get_by_natural_key(
        &self,
        kind: &str,
        natural_key: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let schema = self.schema(kind)?;
        let normalized = normalize_natural_key(natural_key)?;
        let primary_key = resolve_primary_key(schema, natural_key)?;

        if let Some(entity) = self.cache.get(&primary_key) {
            return Ok(Some(entity));
        }
        if let Some(entity) = self.db.docs.get::<Entity>(&primary_key)? {
            self.cache.insert(entity.clone());
            return Ok(Some(entity));
        }

        let members = self
            .index
            .members_of(kind, &schema.natural_key_type, &normalized)?;
        for member in members {
            if let Some(entity) = self.db.docs.get::<Entity>(&member)? {
                self.cache.insert(entity.clone());
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Fetch an entity by primary key.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn get_by_primary_key(&self, primary_key: &str) -> Result<Option<Entity>, StoreError> {
        if let Some(entity) = self.cache.get(primary_key) {
            return Ok(Some(entity));
        }
        let entity: Option<Entity> = self.db.docs.get(primary_key)?;
        if let Some(entity) = &entity {
            self.cache.insert(entity.clone());
        }
        Ok(entity)
    }

    /// List entities holding `value` on an indexed field.
    ///
    /// Orphaned index entries (member without a document) are skipped and
    /// logged; audits report them, rebuilds remove them.
    ///
    /// # Errors
    /// Returns [`StoreError::SchemaViolation`] for non-indexed fields, or a
    /// storage error.
    pub fn get_by_indexed_attribute(
        &self,
        kind: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Entity>, StoreError> {
        let schema = self.schema(kind)?;
        if !Self::index_fields(schema).iter().any(|f| f == field) {
            return Err(StoreError::SchemaViolation(format!(
                "{}.{} is not an indexed field",
                kind, field
            )));
        }

        let members = self.index.members_of(kind, field, value)?;
        let mut entities = Vec::with_capacity(members.len());
        for member in members {
            match self.db.docs.get::<Entity>(&member)? {
                Some(entity) => entities.push(entity),
                None => {
                    tracing::warn!(
                        "Orphaned index entry: {}:{}='{}' lists missing document '{}'",
                        kind,
                        field,
                        value,
                        member
                    );
                }
            }
        }
        Ok(entities)
    }

    /// Exact-match lookup on an identity-bearing indexed field, e.g. a wallet
    /// or linked account id.
    ///
    /// # Errors
    /// Returns an error for non-indexed fields or storage failures.
    pub fn get_by_identity(
        &self,
        kind: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let normalized = value.trim().to_lowercase();
        Ok(self
            .get_by_indexed_attribute(kind, field, &normalized)?
            .into_iter()
            .next())
    }

    /// Delete an entity and every index membership derived from it.
    ///
    /// Writes a tombstone first, then removes memberships, then erases the
    /// document, then clears the tombstone — an interruption at any point
    /// leaves a tombstone a repair pass can finish from.
    ///
    /// # Returns
    /// `true` when an entity was deleted, `false` when it did not exist.
    ///
    /// # Errors
    /// Returns [`StoreError::LockContention`] when the per-key lock is held,
    /// or a storage error.
    pub fn delete(&self, kind: &str, primary_key: &str) -> Result<bool, StoreError> {
        let schema = self.schema(kind)?;
        let _guard = self.db.locks.acquire(
            &entity_lock_key(primary_key),
            self.config.write_lock_ttl_ms,
            "delete",
        )?;

        let Some(entity) = self.db.docs.get::<Entity>(primary_key)? else {
            return Ok(false);
        };

        let marker = tombstone_key(primary_key);
        self.db.docs.set(
            &marker,
            &TombstoneRow {
                entity: entity.clone(),
                created_at: Utc::now(),
            },
        )?;

        self.remove_index_footprint(schema, &entity)?;
        self.db.docs.delete(primary_key)?;
        self.db.docs.delete(&marker)?;
        self.cache.invalidate(primary_key);
        Ok(true)
    }

    /// Remove every index membership implied by `entity`'s current values.
    pub(crate) fn remove_index_footprint(
        &self,
        schema: &KindSchema,
        entity: &Entity,
    ) -> Result<(), StoreError> {
        for field in Self::index_fields(schema) {
            if let Some(value) = schema.indexed_value(entity, &field) {
                self.index
                    .remove_member(&schema.kind, &field, value, &entity.primary_key)?;
            }
        }
        Ok(())
    }

    /// Ensure `entity` is a member of every index implied by its values.
    pub(crate) fn ensure_index_footprint(
        &self,
        schema: &KindSchema,
        entity: &Entity,
    ) -> Result<(), StoreError> {
        for field in Self::index_fields(schema) {
            if let Some(value) = schema.indexed_value(entity, &field) {
                self.index
                    .add_member(&schema.kind, &field, value, &entity.primary_key)?;
            }
        }
        Ok(())
    }

    /// Drain the repair queue: re-apply failed index updates and finish
    /// interrupted deletes.
    ///
    /// Each step re-derives the expected memberships from the live document,
    /// so running this repeatedly is safe.
    ///
    /// # Errors
    /// Returns an error when storage operations fail; already-applied repairs
    /// stay applied.
    pub fn run_repair(&self, kind: &str) -> Result<RepairSummary, StoreError> {
        let schema = self.schema(kind)?;
        let mut summary = RepairSummary::default();

        let mut cursor: Option<String> = None;
        loop {
            let page = self.db.docs.scan_keys(&repair_prefix(kind), cursor.as_deref(), 128)?;
            for key in &page.keys {
                let Some(row) = self.db.docs.get::<RepairRow>(key)? else {
                    continue;
                };
                match self.db.docs.get::<Entity>(&row.primary_key)? {
                    Some(entity) => {
                        let current = schema.indexed_value(&entity, &row.field).map(str::to_string);
                        for stale in [&row.old_value, &row.new_value] {
                            if let Some(value) = stale {
                                if current.as_deref() != Some(value.as_str()) {
                                    self.index.remove_member(
                                        kind,
                                        &row.field,
                                        value,
                                        &row.primary_key,
                                    )?;
                                }
                            }
                        }
                        if let Some(value) = &current {
                            self.index
                                .add_member(kind, &row.field, value, &row.primary_key)?;
                        }
                    }
                    None => {
                        for value in [&row.old_value, &row.new_value].into_iter().flatten() {
                            self.index
                                .remove_member(kind, &row.field, value, &row.primary_key)?;
                        }
                    }
                }
                self.db.docs.delete(key)?;
                summary.repaired_indexes += 1;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let tombstone_prefix = format!("tombstone:{}", schema.key_prefix);
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .db
                .docs
                .scan_keys(&tombstone_prefix, cursor.as_deref(), 128)?;
            for key in &page.keys {
                let Some(row) = self.db.docs.get::<TombstoneRow>(key)? else {
                    continue;
                };
                self.remove_index_footprint(schema, &row.entity)?;
                self.db.docs.delete(&row.entity.primary_key)?;
                self.db.docs.delete(key)?;
                self.cache.invalidate(&row.entity.primary_key);
                summary.finished_deletes += 1;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(summary)
    }

    /// Read-only consistency audit of one index. See [`crate::audit`].
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn run_audit(&self, kind: &str, field: &str) -> Result<AuditReport, StoreError> {
        crate::audit::audit(self, kind, field)
    }

    /// Versioned, non-destructive index rebuild. See [`crate::rebuild`].
    ///
    /// # Errors
    /// Returns [`StoreError::RebuildInProgress`] when another rebuild holds
    /// the advisory lock, or a storage error.
    pub fn run_rebuild(&self, kind: &str, field: &str) -> Result<RebuildReport, StoreError> {
        crate::rebuild::rebuild(self, kind, field)
    }

    /// Detect duplicate natural keys without mutating. See
    /// [`crate::reconcile`].
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn find_duplicates(&self, kind: &str) -> Result<Vec<DuplicateGroup>, StoreError> {
        crate::reconcile::find_duplicates(self, kind)
    }

    /// Merge duplicate entities and sweep invalid keys. See
    /// [`crate::reconcile`].
    ///
    /// # Errors
    /// Returns an error when storage operations fail; completed merges stay
    /// applied and are reported by their persisted records.
    pub fn run_reconciliation(&self, kind: &str) -> Result<Vec<MergeRecord>, StoreError> {
        crate::reconcile::run(self, kind)
    }

    /// Remove expired advisory locks under `prefix`.
    ///
    /// Live locks are refused and counted, never cleared.
    ///
    /// # Returns
    /// `(removed, still_held)` counts.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn sweep_expired_locks(&self, prefix: &str) -> Result<(usize, usize), StoreError> {
        self.db.locks.sweep_expired(prefix)
    }

    /// Invalidate a cached entity after an out-of-band mutation.
    pub(crate) fn invalidate_cached(&self, primary_key: &str) {
        self.cache.invalidate(primary_key);
    }

    /// Drop every cached entity; maintenance operations call this after bulk
    /// mutations.
    pub(crate) fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests;
