//! Versioned schema descriptors and the additive base schema.
//!
//! Every historical on-disk format is an immutable [`SchemaVersion`] in
//! [`SCHEMA_VERSIONS`], ordered oldest to newest; the last entry is the
//! current format. The migrator folds over consecutive entries, so DDL in
//! each descriptor is the delta from its predecessor, not a full schema.
//!
//! [`BASE_SCHEMA_SQL`] is the full current-format DDL, written so that
//! applying it to an up-to-date store is a no-op. It runs on every open and
//! picks up additive changes (new tables, new indexes) without a migration
//! step.

use rusqlite::{Connection, Result};

/// One on-disk schema format.
#[derive(Debug, Clone, Copy)]
pub struct SchemaVersion {
    /// Version name, recorded in the `schema_history` checkpoint table.
    pub name: &'static str,
    /// Value of `PRAGMA user_version` once this format is reached.
    pub user_version: i32,
    /// DDL delta from the previous format.
    pub ddl: &'static str,
}

/// Every supported on-disk format, oldest first. The last entry is current.
///
/// Order is load-bearing: the migrator applies exactly these, one at a
/// time, never skipping. A store older than `quill-1` predates version
/// tracking entirely (`user_version` 0) and walks the whole list.
pub const SCHEMA_VERSIONS: &[SchemaVersion] = &[
    SchemaVersion {
        name: "quill-1",
        user_version: 1,
        ddl: "CREATE TABLE IF NOT EXISTS objects (
                  id TEXT PRIMARY KEY,
                  entity TEXT NOT NULL,
                  properties TEXT NOT NULL DEFAULT '{}',
                  created_at INTEGER NOT NULL
              );
              CREATE INDEX IF NOT EXISTS idx_objects_entity ON objects(entity);",
    },
    SchemaVersion {
        name: "quill-2",
        user_version: 2,
        ddl: "ALTER TABLE objects ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0;
              UPDATE objects SET updated_at = created_at WHERE updated_at = 0;",
    },
    SchemaVersion {
        name: "quill-3",
        user_version: 3,
        ddl: "CREATE INDEX IF NOT EXISTS idx_objects_updated ON objects(updated_at DESC);",
    },
    SchemaVersion {
        name: "quill-4",
        user_version: 4,
        ddl: "CREATE TABLE IF NOT EXISTS tombstones (
                  id TEXT PRIMARY KEY,
                  deleted_at INTEGER NOT NULL
              );",
    },
];

/// The current on-disk format.
#[must_use]
pub fn current_version() -> &'static SchemaVersion {
    // SCHEMA_VERSIONS is a non-empty const.
    &SCHEMA_VERSIONS[SCHEMA_VERSIONS.len() - 1]
}

/// Full current-format DDL, idempotent.
///
/// Mirrors the end state of walking all of [`SCHEMA_VERSIONS`]. Columns
/// added by intermediate versions appear inline here, which is why the
/// migrator tolerates "duplicate column" on stores that were created fresh.
pub const BASE_SCHEMA_SQL: &str = r"
-- ====================
-- Object Graph
-- ====================

CREATE TABLE IF NOT EXISTS objects (
    id TEXT PRIMARY KEY,
    entity TEXT NOT NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_objects_entity ON objects(entity);
CREATE INDEX IF NOT EXISTS idx_objects_updated ON objects(updated_at DESC);

-- Deletions survive as tombstones so sync layers can observe them.
CREATE TABLE IF NOT EXISTS tombstones (
    id TEXT PRIMARY KEY,
    deleted_at INTEGER NOT NULL
);

-- ====================
-- Migration Checkpoints
-- ====================

CREATE TABLE IF NOT EXISTS schema_history (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
";

/// Apply pragmas and the additive base schema.
///
/// Safe to call on every open.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_base_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    conn.execute_batch(BASE_SCHEMA_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_are_strictly_ordered() {
        let mut prev = 0;
        for version in SCHEMA_VERSIONS {
            assert!(
                version.user_version > prev,
                "{} does not advance user_version",
                version.name
            );
            prev = version.user_version;
        }
        assert_eq!(current_version().user_version, prev);
    }

    #[test]
    fn test_apply_base_schema() {
        let conn = Connection::open_in_memory().unwrap();
        apply_base_schema(&conn).expect("Failed to apply schema");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert!(tables.contains(&"objects".to_string()));
        assert!(tables.contains(&"tombstones".to_string()));
        assert!(tables.contains(&"schema_history".to_string()));
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_base_schema(&conn).expect("First apply failed");
        apply_base_schema(&conn).expect("Second apply failed");
    }

    #[test]
    fn test_walking_all_versions_matches_base_schema() {
        // A store migrated from nothing must expose the same tables and
        // columns as a store created fresh from the base schema.
        let migrated = Connection::open_in_memory().unwrap();
        for version in SCHEMA_VERSIONS {
            migrated.execute_batch(version.ddl).unwrap();
        }

        let fresh = Connection::open_in_memory().unwrap();
        fresh.execute_batch(BASE_SCHEMA_SQL).unwrap();

        let columns = |conn: &Connection| -> Vec<String> {
            conn.prepare("SELECT name FROM pragma_table_info('objects') ORDER BY name")
                .unwrap()
                .query_map([], |row| row.get(0))
                .unwrap()
                .collect::<Result<Vec<String>>>()
                .unwrap()
        };
        assert_eq!(columns(&migrated), columns(&fresh));
    }
}
