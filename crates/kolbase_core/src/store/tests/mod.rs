//! Store integration tests.

use super::*;
use crate::config::Config;
use crate::models::{Entity, FieldValue};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn setup_store() -> (EntityStore, TempDir) {
    let temp_dir = TempDir::new().expect("temp dir");
    let config = Config::for_tests(&temp_dir.path().to_string_lossy());
    let store = EntityStore::open(config).expect("open store");
    (store, temp_dir)
}

fn fields(pairs: &[(&str, FieldValue)]) -> BTreeMap<String, FieldValue> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn text(value: &str) -> FieldValue {
    FieldValue::Text(value.to_string())
}

/// Plant an entity under an arbitrary (possibly legacy) primary key, with
/// its index memberships, the way older write paths left data behind.
fn plant_legacy_entity(
    store: &EntityStore,
    primary_key: &str,
    handle: &str,
    field_pairs: &[(&str, FieldValue)],
) -> Entity {
    let now = chrono::Utc::now();
    let mut natural_keys = BTreeMap::new();
    natural_keys.insert("handle".to_string(), handle.to_string());
    let entity = Entity {
        primary_key: primary_key.to_string(),
        kind: "user".to_string(),
        natural_keys,
        fields: fields(field_pairs),
        version: 1,
        created_at: now,
        updated_at: now,
    };
    store
        .db
        .docs
        .set(primary_key, &entity)
        .expect("plant document");
    let schema = store.schema("user").expect("schema");
    store
        .ensure_index_footprint(schema, &entity)
        .expect("plant index footprint");
    entity
}

mod concurrency;
mod maintenance;
