//! redb table definitions shared by storage modules.

use redb::TableDefinition;

/// File name for the redb database within the configured DB directory.
pub const REDB_FILE_NAME: &str = "kolbase.redb";

/// JSON documents by key: entities (`user:*`, `message:*`), index generation
/// pointers (`idxgen:*`), maintenance reports (`report:*`), repair-queue
/// entries (`repair:*`), tombstones (`tombstone:*`), and scan cursors
/// (`cursor:*`).
pub const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// Set membership rows keyed by `(set name, member)`; presence is the value.
pub const SET_MEMBERS: TableDefinition<(&str, &str), ()> = TableDefinition::new("set_members");

/// Advisory lock rows (`LockRow`, JSON-encoded) by lock key.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
