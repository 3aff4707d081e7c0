//! Maintenance-path tests: repair, audit, rebuild, reconciliation.

use super::*;
use crate::error::StoreError;
use crate::models::{RebuildStatus, ReportStatus};
use crate::rebuild::rebuild_lock_key;
use crate::store::set_index_failpoint;

#[test]
fn injected_index_failure_queues_repair_and_is_recoverable() {
    let (store, _temp) = setup_store();

    set_index_failpoint(1);
    let outcome = store
        .put("user", "alice", fields(&[("role", text("kol"))]))
        .expect("document write must succeed despite index failure");
    set_index_failpoint(0);

    assert!(outcome.eventually_consistent);
    let pk = outcome.entity.primary_key.clone();

    // The first index update (natural key) was dropped; the repair row must
    // record it rather than the failure being swallowed.
    assert_eq!(
        store
            .index
            .cardinality("user", "handle", "alice")
            .expect("count"),
        0
    );
    assert!(store
        .db
        .docs
        .exists(&format!("repair:user:{}:handle", pk))
        .expect("repair row"));

    let summary = store.run_repair("user").expect("repair");
    assert_eq!(summary.repaired_indexes, 1);
    assert_eq!(
        store.index.members_of("user", "handle", "alice").expect("index"),
        vec![pk]
    );

    // Index/document agreement holds after repair.
    let audit = store.run_audit("user", "handle").expect("audit");
    assert!(audit.orphaned_members.is_empty());
    assert!(audit.missing_members.is_empty());
}

#[test]
fn repair_finishes_an_interrupted_delete() {
    let (store, _temp) = setup_store();
    let outcome = store
        .put("user", "alice", fields(&[("role", text("kol"))]))
        .expect("put");
    let pk = outcome.entity.primary_key.clone();

    // Simulate a delete that crashed right after writing its tombstone.
    store
        .db
        .docs
        .set(
            &format!("tombstone:{}", pk),
            &crate::store::TombstoneRow {
                entity: outcome.entity.clone(),
                created_at: chrono::Utc::now(),
            },
        )
        .expect("tombstone");

    let summary = store.run_repair("user").expect("repair");
    assert_eq!(summary.finished_deletes, 1);
    assert!(!store.db.docs.exists(&pk).expect("document erased"));
    assert_eq!(
        store.index.cardinality("user", "role", "kol").expect("count"),
        0
    );
}

#[test]
fn audit_reports_orphans_and_rebuild_clears_them() {
    let (store, _temp) = setup_store();
    let alive = store
        .put("user", "alice", fields(&[("role", text("kol"))]))
        .expect("put alice");
    let doomed = store
        .put("user", "bob", fields(&[("role", text("kol"))]))
        .expect("put bob");

    // Legacy-corruption shape: document deleted without index cleanup.
    store
        .db
        .docs
        .delete(&doomed.entity.primary_key)
        .expect("raw delete");

    let audit = store.run_audit("user", "role").expect("audit");
    assert_eq!(audit.orphaned_members, vec![doomed.entity.primary_key.clone()]);
    assert!(audit.drift_pct() > store.config.drift_threshold_pct);
    assert!(audit.exceeds(store.config.drift_threshold_pct));

    let report = store.run_rebuild("user", "role").expect("rebuild");
    assert_eq!(report.status, RebuildStatus::Swapped);
    assert!(report.verified);

    assert_eq!(
        store.index.members_of("user", "role", "kol").expect("members"),
        vec![alive.entity.primary_key]
    );
    let audit = store.run_audit("user", "role").expect("second audit");
    assert!(audit.orphaned_members.is_empty());
    assert_eq!(audit.drift_pct(), 0.0);
}

#[test]
fn rebuild_rolls_back_when_a_bucket_shrinks_suspiciously() {
    let (store, _temp) = setup_store();
    for handle in ["alice", "bob", "carol"] {
        store
            .put("user", handle, fields(&[("role", text("kol"))]))
            .expect("put");
    }
    // A foreign-but-live member inflates the bucket; the rebuild cannot
    // reproduce it, which must read as potential data loss.
    let foreign = store.put("message", "m-1", fields(&[])).expect("put message");
    let bucket = crate::index::bucket_key("user", "role", 0, "kol");
    store
        .db
        .sets
        .add(&bucket, &foreign.entity.primary_key)
        .expect("inflate bucket");

    let members_before = store.db.sets.members(&bucket).expect("members");
    let report = store.run_rebuild("user", "role").expect("rebuild");
    assert_eq!(report.status, RebuildStatus::RolledBack);
    assert!(!report.verified);
    assert!(report.failure_reason.is_some());

    // The live index is untouched, including the suspicious member.
    assert_eq!(store.db.sets.members(&bucket).expect("members"), members_before);
    assert_eq!(store.index.live_generation("user", "role").expect("gen"), 0);
}

#[test]
fn rebuild_fails_fast_while_another_holds_the_lock() {
    let (store, _temp) = setup_store();
    let _held = store
        .db
        .locks
        .acquire(&rebuild_lock_key("user", "role"), 60_000, "other-rebuild")
        .expect("hold rebuild lock");

    let err = store
        .run_rebuild("user", "role")
        .expect_err("must not block behind a running rebuild");
    assert!(matches!(err, StoreError::RebuildInProgress { .. }));
}

#[test]
fn reconciliation_merges_split_profiles_into_one_survivor() {
    let (store, _temp) = setup_store();

    // put(user, "@Alice", {role}) then a legacy write path that minted its
    // own id for the same handle with {bio}.
    store
        .put("user", "@Alice", fields(&[("role", text("user"))]))
        .expect("canonical put");
    plant_legacy_entity(
        &store,
        "user:legacy-7f31",
        "alice",
        &[("bio", text("hi"))],
    );

    let groups = store.find_duplicates("user").expect("find");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].natural_key, "alice");
    assert_eq!(groups[0].members.len(), 2);

    let records = store.run_reconciliation("user").expect("reconcile");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, ReportStatus::Completed);
    assert_eq!(record.removed.len(), 1);
    assert!(record.removed.contains_key("user:legacy-7f31"));

    let survivor = store
        .get_by_natural_key("user", "alice")
        .expect("lookup")
        .expect("survivor");
    assert_eq!(survivor.primary_key, record.survivor);
    assert_eq!(survivor.text_field("role"), Some("user"));
    assert_eq!(survivor.text_field("bio"), Some("hi"));
    assert_eq!(survivor.natural_key("handle"), Some("alice"));

    assert!(store.find_duplicates("user").expect("re-find").is_empty());
    assert_eq!(store.db.docs.count_prefix("user:").expect("docs"), 1);
    assert_eq!(
        store
            .index
            .cardinality("user", "handle", "alice")
            .expect("handle bucket"),
        1
    );
}

#[test]
fn merge_preserves_data_and_flags_identity_conflicts() {
    let (store, _temp) = setup_store();
    store
        .put(
            "user",
            "alice",
            fields(&[
                ("role", text("kol")),
                ("tags", FieldValue::List(vec!["defi".to_string()])),
            ]),
        )
        .expect("canonical put");
    plant_legacy_entity(
        &store,
        "user:legacy-a",
        "alice",
        &[
            ("discord_id", text("111")),
            ("bio", text("first bio")),
            ("tags", FieldValue::List(vec!["nft".to_string()])),
        ],
    );
    plant_legacy_entity(
        &store,
        "user:legacy-b",
        "alice",
        &[("discord_id", text("222"))],
    );

    let records = store.run_reconciliation("user").expect("reconcile");
    assert_eq!(records.len(), 1);
    let record = &records[0];

    // Two disagreeing linked-account ids: flagged, not guessed.
    assert_eq!(record.conflicts.len(), 1);
    assert_eq!(record.conflicts[0].field, "discord_id");
    assert_eq!(record.conflicts[0].candidates.len(), 2);

    let survivor = store
        .get_by_natural_key("user", "alice")
        .expect("lookup")
        .expect("survivor");
    assert!(survivor.field("discord_id").is_none());
    assert_eq!(survivor.text_field("bio"), Some("first bio"));
    let mut tags = survivor.field("tags").and_then(FieldValue::as_list).unwrap().to_vec();
    tags.sort();
    assert_eq!(tags, vec!["defi", "nft"]);

    // Every non-conflicting victim value is either on the survivor or in the
    // recorded conflict — nothing silently lost.
    for victim in record.removed.values() {
        for (name, value) in &victim.fields {
            if value.is_empty() || name == "discord_id" {
                continue;
            }
            let preserved = match survivor.field(name) {
                Some(FieldValue::List(items)) => value
                    .as_list()
                    .map(|merged| merged.iter().all(|item| items.contains(item)))
                    .unwrap_or(false),
                Some(existing) => !existing.is_empty(),
                None => false,
            };
            assert!(preserved, "field '{}' lost in merge", name);
        }
    }
}

#[test]
fn merge_keeps_earliest_created_at() {
    let (store, _temp) = setup_store();
    let outcome = store
        .put("user", "alice", fields(&[("role", text("kol"))]))
        .expect("put");
    let mut legacy = plant_legacy_entity(&store, "user:legacy-old", "alice", &[]);
    legacy.created_at = outcome.entity.created_at - chrono::Duration::days(30);
    store
        .db
        .docs
        .set("user:legacy-old", &legacy)
        .expect("backdate");

    store.run_reconciliation("user").expect("reconcile");
    let survivor = store
        .get_by_natural_key("user", "alice")
        .expect("lookup")
        .expect("survivor");
    assert_eq!(survivor.created_at, legacy.created_at);
}

#[test]
fn reconciliation_sweeps_invalid_key_artifacts() {
    let (store, _temp) = setup_store();
    store
        .put("user", "alice", fields(&[("role", text("kol"))]))
        .expect("put");
    plant_legacy_entity(&store, "user:undefined", "ghost", &[]);

    store.run_reconciliation("user").expect("reconcile");

    assert!(!store.db.docs.exists("user:undefined").expect("swept"));
    assert!(store
        .db
        .docs
        .exists("report:user:sweep:user:undefined")
        .expect("sweep record persisted"));
    assert_eq!(
        store
            .index
            .cardinality("user", "handle", "ghost")
            .expect("ghost memberships removed"),
        0
    );
    assert!(store
        .get_by_natural_key("user", "alice")
        .expect("lookup")
        .is_some());
}

#[test]
fn reconciliation_respects_a_held_maintenance_lock() {
    let (store, _temp) = setup_store();
    let _held = store
        .db
        .locks
        .acquire(&rebuild_lock_key("user", "handle"), 60_000, "rebuild")
        .expect("hold lock");

    let err = store
        .run_reconciliation("user")
        .expect_err("reconciliation must not interleave with a rebuild");
    assert!(matches!(err, StoreError::LockContention { .. }));
}

#[test]
fn merge_records_are_persisted_and_reversible() {
    let (store, _temp) = setup_store();
    store
        .put("user", "alice", fields(&[("role", text("kol"))]))
        .expect("put");
    plant_legacy_entity(&store, "user:legacy-z", "alice", &[("bio", text("bye"))]);

    let records = store.run_reconciliation("user").expect("reconcile");
    let record = &records[0];

    let page = store
        .db
        .docs
        .scan_keys("report:user:merge:", None, 16)
        .expect("scan reports");
    assert_eq!(page.keys.len(), 1);

    // The persisted record carries the removed document in full.
    let snapshot = record.removed.get("user:legacy-z").expect("snapshot");
    assert_eq!(snapshot.text_field("bio"), Some("bye"));
    assert_eq!(record.scores.len(), 2);
}
