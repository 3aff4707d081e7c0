//! Document primitives: JSON rows by key, one transaction per call.
//!
//! Each call is independently idempotent and atomic on its own, mirroring the
//! one-command-at-a-time store this layer abstracts. Multi-step invariants
//! live above, in the store and its maintenance operations.

use crate::db::tables::DOCUMENTS;
use crate::error::StoreError;
use redb::{ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ops::Bound;
use std::sync::Arc;

/// One page of a prefix scan.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub keys: Vec<String>,
    /// Pass back as `cursor` to continue; `None` when the scan is complete.
    pub next_cursor: Option<String>,
}

/// Accessor for the JSON document table.
#[derive(Clone)]
pub struct DocDb {
    db: Arc<redb::Database>,
}

impl DocDb {
    /// Initialize the document table if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error when redb transaction/table initialization fails.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, StoreError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(DOCUMENTS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Fetch and decode a document.
    ///
    /// # Returns
    /// `Ok(Some(value))` when found, `Ok(None)` when missing.
    ///
    /// # Errors
    /// Returns an error when storage access or deserialization fails.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let docs = read_txn.open_table(DOCUMENTS)?;
        match docs.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Whether a document exists under `key`.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let read_txn = self.db.begin_read()?;
        let docs = read_txn.open_table(DOCUMENTS)?;
        Ok(docs.get(key)?.is_some())
    }

    /// Write a document, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error when serialization or storage operations fail.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut docs = write_txn.open_table(DOCUMENTS)?;
            docs.insert(key, encoded.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Delete a document.
    ///
    /// # Returns
    /// `true` when a row was removed, `false` when it was already absent.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut docs = write_txn.open_table(DOCUMENTS)?;
            let removed = docs.remove(key)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// List document keys matching `prefix`, in lexicographic order.
    ///
    /// # Arguments
    /// - `prefix`: Key prefix to match.
    /// - `cursor`: Resume strictly after this key (a prior page's
    ///   `next_cursor`).
    /// - `limit`: Maximum keys per page; must be nonzero.
    ///
    /// # Returns
    /// A [`ScanPage`] whose `next_cursor` is set while more keys remain.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn scan_keys(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        if limit == 0 {
            return Ok(ScanPage {
                keys: Vec::new(),
                next_cursor: cursor.map(str::to_string),
            });
        }

        let read_txn = self.db.begin_read()?;
        let docs = read_txn.open_table(DOCUMENTS)?;

        let lower: Bound<&str> = match cursor {
            Some(after) => Bound::Excluded(after),
            None => Bound::Included(prefix),
        };
        let mut keys = Vec::with_capacity(limit);
        let mut exhausted = true;
        for item in docs.range::<&str>((lower, Bound::Unbounded))? {
            let (key, _) = item?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            if keys.len() == limit {
                exhausted = false;
                break;
            }
            keys.push(key.to_string());
        }

        let next_cursor = if exhausted { None } else { keys.last().cloned() };
        Ok(ScanPage { keys, next_cursor })
    }

    /// Count documents whose key matches `prefix`.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn count_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let read_txn = self.db.begin_read()?;
        let docs = read_txn.open_table(DOCUMENTS)?;
        let mut count = 0u64;
        for item in docs.range(prefix..)? {
            let (key, _) = item?;
            if !key.value().starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}
