//! Secondary-index maintenance over the set store.
//!
//! One index per `(kind, field)`; one bucket per attribute value. Buckets are
//! namespaced by a generation number so a rebuild can populate the next
//! generation while readers keep resolving the live one, then swap with a
//! single pointer write.

use crate::db::{DocDb, SetDb};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 10;

/// A retired index generation kept for recovery until pruned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredGeneration {
    pub generation: u64,
    pub retired_at: DateTime<Utc>,
}

/// Pointer document selecting the live generation of one index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationPointer {
    pub live: u64,
    #[serde(default)]
    pub backups: Vec<RetiredGeneration>,
}

/// Maintains secondary indexes: membership mutation, lookup, and the
/// generation pointers used by versioned rebuilds.
#[derive(Clone)]
pub struct IndexManager {
    docs: DocDb,
    sets: SetDb,
}

/// Key of the generation pointer document for `(kind, field)`.
pub fn generation_pointer_key(kind: &str, field: &str) -> String {
    format!("idxgen:{}:{}", kind, field)
}

/// Name of the bucket holding members with `value` in generation `gen`.
pub fn bucket_key(kind: &str, field: &str, gen: u64, value: &str) -> String {
    format!("idx:{}:{}:g{}:{}", kind, field, gen, value)
}

/// Prefix shared by every bucket of generation `gen`.
pub fn bucket_prefix(kind: &str, field: &str, gen: u64) -> String {
    format!("idx:{}:{}:g{}:", kind, field, gen)
}

impl IndexManager {
    /// Build an index manager over the given primitive stores.
    pub fn new(docs: DocDb, sets: SetDb) -> Self {
        Self { docs, sets }
    }

    /// Run `op` with bounded exponential backoff on transient storage errors.
    ///
    /// Transient failures are never swallowed: the last error surfaces once
    /// attempts are exhausted.
    fn with_retry<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                    tracing::warn!(
                        "Transient failure on {} (attempt {}/{}): {}; retrying in {:?}",
                        label,
                        attempt,
                        RETRY_ATTEMPTS,
                        err,
                        delay
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Live generation of the `(kind, field)` index; zero before any rebuild.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn live_generation(&self, kind: &str, field: &str) -> Result<u64, StoreError> {
        Ok(self
            .docs
            .get::<GenerationPointer>(&generation_pointer_key(kind, field))?
            .map(|pointer| pointer.live)
            .unwrap_or(0))
    }

    /// Full pointer row for `(kind, field)`, including retired backups.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn generation_pointer(
        &self,
        kind: &str,
        field: &str,
    ) -> Result<GenerationPointer, StoreError> {
        Ok(self
            .docs
            .get::<GenerationPointer>(&generation_pointer_key(kind, field))?
            .unwrap_or_default())
    }

    /// Add `primary_key` to the live bucket for `value`. Idempotent.
    ///
    /// # Errors
    /// Returns [`StoreError::IndexWriteFailed`] when storage keeps failing
    /// after retries.
    pub fn add_member(
        &self,
        kind: &str,
        field: &str,
        value: &str,
        primary_key: &str,
    ) -> Result<(), StoreError> {
        let gen = self.live_generation(kind, field)?;
        let bucket = bucket_key(kind, field, gen, value);
        self.with_retry(&bucket, || self.sets.add(&bucket, primary_key).map(|_| ()))
            .map_err(|err| index_write_failed(&bucket, err))
    }

    /// Remove `primary_key` from the live bucket for `value`. Idempotent.
    ///
    /// # Errors
    /// Returns [`StoreError::IndexWriteFailed`] when storage keeps failing
    /// after retries.
    pub fn remove_member(
        &self,
        kind: &str,
        field: &str,
        value: &str,
        primary_key: &str,
    ) -> Result<(), StoreError> {
        let gen = self.live_generation(kind, field)?;
        let bucket = bucket_key(kind, field, gen, value);
        self.with_retry(&bucket, || self.sets.remove(&bucket, primary_key).map(|_| ()))
            .map_err(|err| index_write_failed(&bucket, err))
    }

    /// Move `primary_key` between buckets when an indexed field changes.
    ///
    /// The new membership lands before the old one is removed, so an
    /// interruption leaves the member visible in at least one bucket; the
    /// transient double membership is what audits and rebuilds repair.
    ///
    /// # Errors
    /// Returns [`StoreError::IndexWriteFailed`] when storage keeps failing
    /// after retries.
    pub fn move_member(
        &self,
        kind: &str,
        field: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
        primary_key: &str,
    ) -> Result<(), StoreError> {
        if old_value == new_value {
            return Ok(());
        }
        if let Some(new_value) = new_value {
            self.add_member(kind, field, new_value, primary_key)?;
        }
        if let Some(old_value) = old_value {
            self.remove_member(kind, field, old_value, primary_key)?;
        }
        Ok(())
    }

    /// Members of the live bucket for `value`, in lexicographic order.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn members_of(
        &self,
        kind: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<String>, StoreError> {
        let gen = self.live_generation(kind, field)?;
        self.sets.members(&bucket_key(kind, field, gen, value))
    }

    /// Membership count of the live bucket for `value`.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn cardinality(&self, kind: &str, field: &str, value: &str) -> Result<u64, StoreError> {
        let gen = self.live_generation(kind, field)?;
        self.sets.cardinality(&bucket_key(kind, field, gen, value))
    }

    /// Bucket names of generation `gen`, paired with their attribute values.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn buckets(
        &self,
        kind: &str,
        field: &str,
        gen: u64,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let prefix = bucket_prefix(kind, field, gen);
        let names = self.sets.scan_sets(&prefix)?;
        Ok(names
            .into_iter()
            .map(|name| {
                let value = name[prefix.len()..].to_string();
                (value, name)
            })
            .collect())
    }

    /// Delete every bucket of generation `gen`.
    ///
    /// # Returns
    /// Number of memberships removed.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn clear_generation(&self, kind: &str, field: &str, gen: u64) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        for (_, bucket) in self.buckets(kind, field, gen)? {
            removed += self.sets.clear(&bucket)?;
        }
        Ok(removed)
    }

    /// Atomically make `new_gen` the live generation.
    ///
    /// The previous generation is retained as a timestamped backup; backups
    /// past `retention` are returned for the caller to prune.
    ///
    /// # Returns
    /// Generations whose buckets should now be deleted.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn swap_generation(
        &self,
        kind: &str,
        field: &str,
        new_gen: u64,
        retention: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let mut pointer = self.generation_pointer(kind, field)?;
        pointer.backups.push(RetiredGeneration {
            generation: pointer.live,
            retired_at: Utc::now(),
        });
        pointer.live = new_gen;

        let mut pruned = Vec::new();
        while pointer.backups.len() > retention {
            pruned.push(pointer.backups.remove(0).generation);
        }

        self.docs
            .set(&generation_pointer_key(kind, field), &pointer)?;
        Ok(pruned)
    }
}

fn index_write_failed(bucket: &str, err: StoreError) -> StoreError {
    match err {
        already @ StoreError::IndexWriteFailed { .. } => already,
        other => StoreError::IndexWriteFailed {
            index: bucket.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    fn setup() -> (Database, IndexManager, TempDir) {
        let temp_dir = TempDir::new().expect("temp dir");
        let db_path = temp_dir.path().join("test.redb");
        let db = Database::new(db_path.to_str().unwrap()).expect("open db");
        let index = IndexManager::new(db.docs.clone(), db.sets.clone());
        (db, index, temp_dir)
    }

    #[test]
    fn add_and_remove_members_are_idempotent() {
        let (_db, index, _temp) = setup();
        index.add_member("user", "role", "kol", "user:a").expect("add");
        index.add_member("user", "role", "kol", "user:a").expect("re-add");
        assert_eq!(index.members_of("user", "role", "kol").expect("members"), vec!["user:a"]);

        index.remove_member("user", "role", "kol", "user:a").expect("remove");
        index
            .remove_member("user", "role", "kol", "user:a")
            .expect("re-remove");
        assert!(index.members_of("user", "role", "kol").expect("members").is_empty());
    }

    #[test]
    fn move_member_lands_in_exactly_one_bucket() {
        let (_db, index, _temp) = setup();
        index.add_member("user", "role", "user", "user:a").expect("add");
        index
            .move_member("user", "role", Some("user"), Some("kol"), "user:a")
            .expect("move");

        assert!(index.members_of("user", "role", "user").expect("members").is_empty());
        assert_eq!(index.members_of("user", "role", "kol").expect("members"), vec!["user:a"]);
    }

    #[test]
    fn move_member_handles_first_write_and_field_clears() {
        let (_db, index, _temp) = setup();
        index
            .move_member("user", "role", None, Some("kol"), "user:a")
            .expect("first write");
        assert_eq!(index.cardinality("user", "role", "kol").expect("count"), 1);

        index
            .move_member("user", "role", Some("kol"), None, "user:a")
            .expect("clear");
        assert_eq!(index.cardinality("user", "role", "kol").expect("count"), 0);
    }

    #[test]
    fn swap_generation_redirects_readers_and_reports_pruned() {
        let (_db, index, _temp) = setup();
        index.add_member("user", "role", "kol", "user:old").expect("add g0");

        // Populate generation 1 directly, then swap to it.
        let bucket = bucket_key("user", "role", 1, "kol");
        index.sets.add(&bucket, "user:new").expect("add g1");

        let pruned = index
            .swap_generation("user", "role", 1, 1)
            .expect("swap keeps one backup");
        assert!(pruned.is_empty());
        assert_eq!(
            index.members_of("user", "role", "kol").expect("members"),
            vec!["user:new"]
        );

        // A second swap with retention 1 prunes generation 0.
        let bucket = bucket_key("user", "role", 2, "kol");
        index.sets.add(&bucket, "user:newer").expect("add g2");
        let pruned = index.swap_generation("user", "role", 2, 1).expect("swap");
        assert_eq!(pruned, vec![0]);
    }

    #[test]
    fn buckets_lists_values_of_one_generation() {
        let (_db, index, _temp) = setup();
        index.add_member("user", "role", "admin", "user:a").expect("add");
        index.add_member("user", "role", "kol", "user:b").expect("add");

        let buckets = index.buckets("user", "role", 0).expect("buckets");
        let values: Vec<&str> = buckets.iter().map(|(value, _)| value.as_str()).collect();
        assert_eq!(values, vec!["admin", "kol"]);
    }
}
