//! TTL-bounded advisory locks stored in the database.
//!
//! Locks are cooperative markers, not OS primitives: holders identify
//! themselves by token, every lock expires so a crashed holder cannot wedge
//! the system, and acquisition on a held lock fails fast instead of blocking.

use crate::db::tables::LOCKS;
use crate::error::StoreError;
use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct LockRow {
    token: String,
    holder: String,
    expires_at_ms: i64,
}

/// Accessor for the advisory lock table.
#[derive(Clone, Debug)]
pub struct LockDb {
    db: Arc<redb::Database>,
}

/// Held advisory lock.
///
/// Dropping the guard releases the lock best-effort; release failures are
/// logged, and the TTL reclaims the lock regardless.
#[derive(Debug)]
pub struct LockGuard {
    locks: LockDb,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Lock key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the lock's TTL.
    ///
    /// # Errors
    /// Returns [`StoreError::LockContention`] when the lock was lost (expired
    /// and taken over), or a storage error.
    pub fn refresh(&self, ttl_ms: u64) -> Result<(), StoreError> {
        self.locks.refresh(&self.key, &self.token, ttl_ms)
    }

    /// Release the lock explicitly.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.locks.release(&self.key, &self.token)?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.locks.release(&self.key, &self.token) {
            tracing::warn!(
                "Failed to release advisory lock '{}' during drop: {}",
                self.key,
                err
            );
        }
    }
}

impl LockDb {
    /// Initialize the lock table if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error when redb transaction/table initialization fails.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, StoreError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(LOCKS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Acquire the lock at `key` for `ttl_ms`.
    ///
    /// Expired rows are reclaimed in the same transaction, so a crashed
    /// holder delays a successor by at most one TTL.
    ///
    /// # Arguments
    /// - `key`: Lock key, e.g. `lock:entity:user:ab12`.
    /// - `ttl_ms`: Time until the lock self-expires.
    /// - `holder`: Human-readable holder label for diagnostics.
    ///
    /// # Returns
    /// A [`LockGuard`] releasing the lock on drop.
    ///
    /// # Errors
    /// Returns [`StoreError::LockContention`] when a live lock is held by
    /// someone else; callers should treat this as retry-later, never fatal.
    pub fn acquire(&self, key: &str, ttl_ms: u64, holder: &str) -> Result<LockGuard, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let token = Uuid::new_v4().to_string();
        let row = LockRow {
            token: token.clone(),
            holder: holder.to_string(),
            expires_at_ms: now_ms + ttl_ms as i64,
        };
        let encoded = serde_json::to_vec(&row)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut locks = write_txn.open_table(LOCKS)?;
            if let Some(existing) = locks.get(key)? {
                let current: LockRow = serde_json::from_slice(existing.value())?;
                if current.expires_at_ms > now_ms {
                    return Err(StoreError::LockContention {
                        scope: key.to_string(),
                    });
                }
                tracing::debug!(
                    "Reclaiming expired lock '{}' previously held by '{}'",
                    key,
                    current.holder
                );
                drop(existing);
            }
            locks.insert(key, encoded.as_slice())?;
        }
        write_txn.commit()?;

        Ok(LockGuard {
            locks: self.clone(),
            key: key.to_string(),
            token,
            released: false,
        })
    }

    fn refresh(&self, key: &str, token: &str, ttl_ms: u64) -> Result<(), StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let write_txn = self.db.begin_write()?;
        {
            let mut locks = write_txn.open_table(LOCKS)?;
            let Some(existing) = locks.get(key)? else {
                return Err(StoreError::LockContention {
                    scope: key.to_string(),
                });
            };
            let mut current: LockRow = serde_json::from_slice(existing.value())?;
            if current.token != token {
                return Err(StoreError::LockContention {
                    scope: key.to_string(),
                });
            }
            drop(existing);
            current.expires_at_ms = now_ms + ttl_ms as i64;
            let encoded = serde_json::to_vec(&current)?;
            locks.insert(key, encoded.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Release the lock at `key` when `token` still owns it.
    ///
    /// Releasing a lock that expired and was taken over is a no-op: the new
    /// holder's row is left untouched.
    ///
    /// # Returns
    /// `true` when this call removed the row.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn release(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut locks = write_txn.open_table(LOCKS)?;
            let owned = match locks.get(key)? {
                Some(existing) => {
                    let current: LockRow = serde_json::from_slice(existing.value())?;
                    current.token == token
                }
                None => false,
            };
            if owned {
                locks.remove(key)?;
            }
            owned
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Remove expired lock rows under `prefix`.
    ///
    /// Live locks are left untouched and counted separately; refusing to
    /// clear a held lock is the caller's protection against racing an active
    /// writer.
    ///
    /// # Returns
    /// `(removed, still_held)` counts.
    ///
    /// # Errors
    /// Returns an error when storage operations fail.
    pub fn sweep_expired(&self, prefix: &str) -> Result<(usize, usize), StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let write_txn = self.db.begin_write()?;
        let counts = {
            let mut locks = write_txn.open_table(LOCKS)?;
            let mut expired = Vec::new();
            let mut still_held = 0usize;
            for item in locks.range(prefix..)? {
                let (key, value) = item?;
                if !key.value().starts_with(prefix) {
                    break;
                }
                let row: LockRow = serde_json::from_slice(value.value())?;
                if row.expires_at_ms <= now_ms {
                    expired.push(key.value().to_string());
                } else {
                    still_held += 1;
                }
            }
            for key in &expired {
                tracing::warn!("Force removing expired advisory lock: {}", key);
                locks.remove(key.as_str())?;
            }
            (expired.len(), still_held)
        };
        write_txn.commit()?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use crate::error::StoreError;
    use tempfile::TempDir;

    fn setup() -> (Database, TempDir) {
        let temp_dir = TempDir::new().expect("temp dir");
        let db_path = temp_dir.path().join("test.redb");
        let db = Database::new(db_path.to_str().unwrap()).expect("open db");
        (db, temp_dir)
    }

    #[test]
    fn acquire_conflicts_while_held_and_frees_on_release() {
        let (db, _temp) = setup();
        let guard = db.locks.acquire("lock:entity:a", 60_000, "w1").expect("acquire");

        let err = db
            .locks
            .acquire("lock:entity:a", 60_000, "w2")
            .expect_err("held lock must conflict");
        assert!(matches!(err, StoreError::LockContention { .. }));

        guard.release().expect("release");
        let _second = db
            .locks
            .acquire("lock:entity:a", 60_000, "w2")
            .expect("released lock is acquirable");
    }

    #[test]
    fn dropping_a_guard_releases_the_lock() {
        let (db, _temp) = setup();
        {
            let _guard = db.locks.acquire("lock:entity:b", 60_000, "w1").expect("acquire");
        }
        let _guard = db
            .locks
            .acquire("lock:entity:b", 60_000, "w2")
            .expect("dropped guard must free the lock");
    }

    #[test]
    fn expired_locks_are_reclaimed() {
        let (db, _temp) = setup();
        let guard = db.locks.acquire("lock:entity:c", 0, "crashed").expect("acquire");
        // TTL of zero: the row is expired as soon as it lands.
        let second = db
            .locks
            .acquire("lock:entity:c", 60_000, "w2")
            .expect("expired lock must be reclaimable");

        // The crashed holder's late release must not evict the new holder.
        drop(guard);
        let err = db
            .locks
            .acquire("lock:entity:c", 60_000, "w3")
            .expect_err("new holder still owns the lock");
        assert!(matches!(err, StoreError::LockContention { .. }));
        drop(second);
    }

    #[test]
    fn refresh_extends_only_the_owning_token() {
        let (db, _temp) = setup();
        let guard = db.locks.acquire("lock:rebuild:x", 60_000, "w1").expect("acquire");
        guard.refresh(120_000).expect("refresh own lock");
    }

    #[test]
    fn sweep_removes_expired_and_counts_held() {
        let (db, _temp) = setup();
        let _expired = db.locks.acquire("lock:entity:dead", 0, "crashed").expect("acquire");
        let _held = db.locks.acquire("lock:entity:live", 60_000, "w1").expect("acquire");

        let (removed, still_held) = db.locks.sweep_expired("lock:").expect("sweep");
        assert_eq!(removed, 1);
        assert_eq!(still_held, 1);

        let _reacquired = db
            .locks
            .acquire("lock:entity:dead", 60_000, "w2")
            .expect("swept lock is acquirable");
    }
}
