//! Set-store primitives over composite `(set, member)` keys.
//!
//! Backs the secondary indexes: one named set per `(kind, field, generation,
//! value)` bucket. Add and remove are idempotent so interrupted callers can
//! simply re-apply.

use crate::db::tables::SET_MEMBERS;
use crate::error::StoreError;
use redb::{ReadableDatabase, ReadableTable};
use std::ops::Bound;
use std::sync::Arc;

/// Accessor for the set membership table.
#[derive(Clone)]
pub struct SetDb {
    db: Arc<redb::Database>,
}

impl SetDb {
    /// Initialize the membership table if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error when redb transaction/table initialization fails.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, StoreError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(SET_MEMBERS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Add `member` to `set`.
    ///
    /// # Returns
    /// `true` when the member was newly added, `false` when already present.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn add(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let added = {
            let mut members = write_txn.open_table(SET_MEMBERS)?;
            let added = members.insert((set, member), ())?.is_none();
            added
        };
        write_txn.commit()?;
        Ok(added)
    }

    /// Remove `member` from `set`.
    ///
    /// # Returns
    /// `true` when a membership was removed, `false` when already absent.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut members = write_txn.open_table(SET_MEMBERS)?;
            let removed = members.remove((set, member))?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Whether `member` belongs to `set`.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn contains(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let read_txn = self.db.begin_read()?;
        let members = read_txn.open_table(SET_MEMBERS)?;
        Ok(members.get((set, member))?.is_some())
    }

    /// All members of `set`, in lexicographic order.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SET_MEMBERS)?;
        let mut members = Vec::new();
        for item in table.range((set, "")..)? {
            let (key, _) = item?;
            let (name, member) = key.value();
            if name != set {
                break;
            }
            members.push(member.to_string());
        }
        Ok(members)
    }

    /// Number of members in `set`.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn cardinality(&self, set: &str) -> Result<u64, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SET_MEMBERS)?;
        let mut count = 0u64;
        for item in table.range((set, "")..)? {
            let (key, _) = item?;
            if key.value().0 != set {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Remove every member of `set`.
    ///
    /// # Returns
    /// Number of memberships removed.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn clear(&self, set: &str) -> Result<u64, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SET_MEMBERS)?;
            let mut doomed = Vec::new();
            for item in table.range((set, "")..)? {
                let (key, _) = item?;
                let (name, member) = key.value();
                if name != set {
                    break;
                }
                doomed.push(member.to_string());
            }
            for member in &doomed {
                table.remove((set, member.as_str()))?;
            }
            doomed.len() as u64
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Distinct set names starting with `prefix`, in lexicographic order.
    ///
    /// Used to enumerate the buckets of one index generation.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn scan_sets(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SET_MEMBERS)?;
        let mut names: Vec<String> = Vec::new();
        let lower: Bound<(&str, &str)> = Bound::Included((prefix, ""));
        for item in table.range((lower, Bound::Unbounded))? {
            let (key, _) = item?;
            let (name, _) = key.value();
            if !name.starts_with(prefix) {
                break;
            }
            if names.last().map(String::as_str) != Some(name) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use tempfile::TempDir;

    fn setup() -> (Database, TempDir) {
        let temp_dir = TempDir::new().expect("temp dir");
        let db_path = temp_dir.path().join("test.redb");
        let db = Database::new(db_path.to_str().unwrap()).expect("open db");
        (db, temp_dir)
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let (db, _temp) = setup();
        assert!(db.sets.add("idx:user:role:g0:kol", "user:a").expect("add"));
        assert!(!db.sets.add("idx:user:role:g0:kol", "user:a").expect("re-add"));
        assert!(db.sets.remove("idx:user:role:g0:kol", "user:a").expect("remove"));
        assert!(!db
            .sets
            .remove("idx:user:role:g0:kol", "user:a")
            .expect("re-remove"));
    }

    #[test]
    fn members_and_cardinality_stay_within_one_set() {
        let (db, _temp) = setup();
        db.sets.add("s:a", "m2").expect("add");
        db.sets.add("s:a", "m1").expect("add");
        db.sets.add("s:b", "m3").expect("add");

        assert_eq!(db.sets.members("s:a").expect("members"), vec!["m1", "m2"]);
        assert_eq!(db.sets.cardinality("s:a").expect("cardinality"), 2);
        assert!(db.sets.contains("s:b", "m3").expect("contains"));
        assert!(!db.sets.contains("s:a", "m3").expect("contains"));
    }

    #[test]
    fn clear_removes_only_the_named_set() {
        let (db, _temp) = setup();
        db.sets.add("s:a", "m1").expect("add");
        db.sets.add("s:a", "m2").expect("add");
        db.sets.add("s:b", "m3").expect("add");

        assert_eq!(db.sets.clear("s:a").expect("clear"), 2);
        assert!(db.sets.members("s:a").expect("members").is_empty());
        assert_eq!(db.sets.members("s:b").expect("members"), vec!["m3"]);
    }

    #[test]
    fn scan_sets_lists_distinct_bucket_names() {
        let (db, _temp) = setup();
        db.sets.add("idx:user:role:g0:admin", "user:a").expect("add");
        db.sets.add("idx:user:role:g0:kol", "user:b").expect("add");
        db.sets.add("idx:user:role:g0:kol", "user:c").expect("add");
        db.sets.add("idx:user:status:g0:ok", "user:a").expect("add");

        let buckets = db.sets.scan_sets("idx:user:role:g0:").expect("scan");
        assert_eq!(
            buckets,
            vec!["idx:user:role:g0:admin", "idx:user:role:g0:kol"]
        );
    }
}
