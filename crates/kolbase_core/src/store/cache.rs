//! Read-through entity cache with TTL and write-path invalidation.
//!
//! Owned by the store, not a module-level singleton: every write path either
//! refreshes or invalidates the affected entry, so a cached read is never
//! older than the TTL.

use crate::models::Entity;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    entity: Entity,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

/// TTL-bounded cache of entities by primary key.
pub struct EntityCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl EntityCache {
    /// Create a cache with the given TTL and capacity.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Cached entity for `primary_key`, if present and fresh.
    pub fn get(&self, primary_key: &str) -> Option<Entity> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(primary_key) {
            Some(entry) if !entry.is_expired(self.ttl) => Some(entry.entity.clone()),
            Some(_) => {
                entries.remove(primary_key);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh an entry.
    pub fn insert(&self, entity: Entity) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() >= self.capacity {
            entries.retain(|_, entry| !entry.is_expired(self.ttl));
        }
        if entries.len() >= self.capacity {
            // Still full after dropping expired entries: evict the oldest.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            entity.primary_key.clone(),
            CacheEntry {
                entity,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop the entry for `primary_key`, if any.
    pub fn invalidate(&self, primary_key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(primary_key);
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
