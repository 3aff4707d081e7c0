//! Database layer: primitive document/set/lock stores over redb.

/// Document primitives (JSON rows, prefix scans).
pub mod docs;
/// TTL advisory lock primitives.
pub mod lock;
/// Set membership primitives (index buckets).
pub mod sets;
/// redb table definitions.
pub mod tables;

use crate::error::StoreError;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

pub use docs::{DocDb, ScanPage};
pub use lock::{LockDb, LockGuard};
pub use sets::SetDb;

/// Database handle with access to the primitive stores.
pub struct Database {
    pub db: Arc<redb::Database>,
    pub docs: DocDb,
    pub sets: SetDb,
    pub locks: LockDb,
}

impl Database {
    /// Open the database file and initialize tables.
    ///
    /// # Returns
    /// A fully initialized [`Database`].
    ///
    /// # Errors
    /// Returns an error when redb cannot open the file or tables.
    pub fn new(path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db = match redb::Database::create(path) {
            Ok(db) => Arc::new(db),
            Err(err) => {
                return Err(StoreError::StorageMessage(format!(
                    "Failed to open database at '{}': {}. \
                     Another process may hold it; set KOLBASE_DB_PATH to use a different location.",
                    path, err
                )))
            }
        };

        Self::from_shared(db)
    }

    /// Build a database handle from an existing shared redb instance.
    ///
    /// Used when multiple components in the same process need independent
    /// accessors without reopening the database path.
    ///
    /// # Errors
    /// Returns an error if the required tables cannot be opened.
    pub fn from_shared(db: Arc<redb::Database>) -> Result<Self, StoreError> {
        Ok(Self {
            docs: DocDb::new(db.clone())?,
            sets: SetDb::new(db.clone())?,
            locks: LockDb::new(db.clone())?,
            db,
        })
    }

    /// Clone this handle for another subsystem in the same process.
    ///
    /// # Errors
    /// Returns an error if accessor initialization fails.
    pub fn share(&self) -> Result<Self, StoreError> {
        Self::from_shared(self.db.clone())
    }
}

/// Copy the database file aside before a destructive maintenance operation.
///
/// # Returns
/// The backup path, or an empty string when the database file does not exist.
///
/// # Errors
/// Returns an error when the copy fails.
pub fn backup_database_file(db_path: &str) -> Result<String, StoreError> {
    let source = Path::new(db_path);
    if !source.exists() {
        return Ok(String::new());
    }

    let timestamp = Utc::now().timestamp();
    let backup_path = source.with_extension(format!("backup.{}", timestamp));
    std::fs::copy(source, &backup_path).map_err(|err| {
        StoreError::StorageMessage(format!("Failed to back up database: {}", err))
    })?;

    tracing::debug!("Created database backup at: {:?}", backup_path);
    Ok(backup_path.to_string_lossy().to_string())
}
