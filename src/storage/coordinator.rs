//! Store coordinator: the single physical connection to the persisted
//! object graph.
//!
//! Opening runs migration first, then connects with WAL and a busy timeout
//! and applies the additive base schema. When the open fails the existing
//! file is copied to a `~`-suffixed sibling, the original (plus WAL/SHM
//! siblings) is deleted, and the open is retried against a fresh store. A
//! second failure is an environment fault: the configured fatal hook is
//! invoked, and the default hook aborts the process.
//!
//! Save failures are NOT routed through the hook. They surface as
//! [`Error::SaveFailed`] so callers decide whether to retry or escalate;
//! pending context state is retained by the save coordinator.

use crate::error::{Error, Result};
use crate::model::{ManagedObject, ObjectId};
use crate::storage::schema::{self, SCHEMA_VERSIONS};
use crate::storage::{locator, migrations};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Hook invoked when the store cannot be opened even after
/// backup-and-recreate.
///
/// The default hook logs and aborts the process. Tests install a hook that
/// records the fault instead; when the hook returns, the open error is
/// propagated to the caller.
pub type FatalHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Configuration for the persistence layer.
#[derive(Clone)]
pub struct StoreConfig {
    /// Explicit store path; overrides environment and default resolution.
    pub path: Option<PathBuf>,
    /// SQLite busy timeout for the shared connection.
    pub busy_timeout: Duration,
    on_fatal: FatalHook,
}

impl StoreConfig {
    /// Configuration with default resolution and a 5 second busy timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the store to an explicit file path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Override the busy timeout.
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Replace the fatal hook (test seam for the termination path).
    #[must_use]
    pub fn with_fatal_hook(mut self, hook: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_fatal = Arc::new(hook);
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout: Duration::from_secs(5),
            on_fatal: Arc::new(|err| {
                error!(error = %err, "unrecoverable store fault");
                std::process::abort();
            }),
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("path", &self.path)
            .field("busy_timeout", &self.busy_timeout)
            .finish_non_exhaustive()
    }
}

/// Owner of the single physical store connection.
pub struct StoreCoordinator {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for StoreCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCoordinator")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl StoreCoordinator {
    /// Resolve the store path, migrate, and open.
    ///
    /// On open failure the file is backed up and the store recreated; a
    /// second failure invokes the fatal hook before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NewerSchema`] without touching the file when the
    /// store was written by a newer build, or the retry error when even the
    /// recreated store cannot be opened (only reachable with a non-aborting
    /// fatal hook).
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = locator::resolve_store_path(config.path.as_deref())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match Self::open_store(&path, config) {
            Ok(conn) => conn,
            // A newer on-disk format is valid data we must not destroy.
            Err(err @ Error::NewerSchema { .. }) => return Err(err),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "store open failed, backing up and recreating"
                );
                match Self::backup_and_recreate(&path)
                    .and_then(|()| Self::open_store(&path, config))
                {
                    Ok(conn) => {
                        info!(path = %path.display(), "store recreated after backup");
                        conn
                    }
                    Err(retry_err) => {
                        error!(
                            path = %path.display(),
                            error = %retry_err,
                            "store open failed after recreate"
                        );
                        (config.on_fatal)(&retry_err);
                        return Err(retry_err);
                    }
                }
            }
        };

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Migrate if a store exists, then connect and apply the base schema.
    fn open_store(path: &Path, config: &StoreConfig) -> Result<Connection> {
        let first_launch = !path.exists();
        if first_launch {
            info!(path = %path.display(), "creating store");
        } else {
            migrations::migrate_store(path, SCHEMA_VERSIONS)?;
        }

        let conn = Connection::open(path)
            .map_err(|source| Error::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;
        conn.busy_timeout(config.busy_timeout)?;
        schema::apply_base_schema(&conn)?;

        if first_launch {
            migrations::mark_baseline(&conn, SCHEMA_VERSIONS)?;
        }
        Ok(conn)
    }

    /// Copy the store to its `~` sibling and delete the original.
    fn backup_and_recreate(path: &Path) -> Result<()> {
        let backup = locator::backup_path(path);
        std::fs::copy(path, &backup)?;
        warn!(backup = %backup.display(), "corrupt store backed up");

        std::fs::remove_file(path)?;
        for suffix in ["-wal", "-shm"] {
            let mut name = path.as_os_str().to_os_string();
            name.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(name));
        }
        Ok(())
    }

    /// Resolved location of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist one save's changes in a single IMMEDIATE transaction.
    ///
    /// Upserts merge properties key-by-key with the incoming value winning
    /// over the persisted one; deletions remove the row and leave a
    /// tombstone. `label` names the saving context for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SaveFailed`] and rolls back on any failure; the
    /// store is unchanged.
    pub fn save_objects(
        &self,
        label: &str,
        upserts: &[ManagedObject],
        deletes: &[ObjectId],
    ) -> Result<()> {
        let save_error = |source: rusqlite::Error| Error::SaveFailed {
            context: label.to_string(),
            source,
        };

        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(save_error)?;

        for object in upserts {
            upsert_object(&tx, object).map_err(save_error)?;
        }
        for id in deletes {
            delete_object(&tx, id).map_err(save_error)?;
        }

        tx.commit().map_err(save_error)
    }

    /// Point lookup by durable id.
    ///
    /// Temporary ids are never stored, so they resolve to `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn fetch(&self, id: &ObjectId) -> Result<Option<ManagedObject>> {
        let Some(key) = id.as_durable() else {
            return Ok(None);
        };

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let row = conn
            .query_row(
                "SELECT entity, properties, created_at, updated_at FROM objects WHERE id = ?1",
                [key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(entity, properties, created_at, updated_at)| ManagedObject {
            id: id.clone(),
            entity,
            properties: parse_properties(&properties),
            created_at,
            updated_at,
        }))
    }
}

fn upsert_object(tx: &Transaction<'_>, object: &ManagedObject) -> rusqlite::Result<()> {
    let Some(key) = object.id.as_durable() else {
        // Saves assign durable ids first; a temporary id here is a
        // coordinator bug, not worth failing the whole save over.
        warn!(id = %object.id, "skipping object with temporary id");
        return Ok(());
    };

    let existing: Option<String> = tx
        .query_row("SELECT properties FROM objects WHERE id = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;

    match existing {
        Some(stored) => {
            let mut merged = parse_properties(&stored);
            for (prop, value) in &object.properties {
                merged.insert(prop.clone(), value.clone());
            }
            tx.execute(
                "UPDATE objects SET entity = ?2, properties = ?3, updated_at = ?4 WHERE id = ?1",
                rusqlite::params![
                    key,
                    object.entity,
                    Value::Object(merged).to_string(),
                    object.updated_at,
                ],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO objects (id, entity, properties, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    key,
                    object.entity,
                    Value::Object(object.properties.clone()).to_string(),
                    object.created_at,
                    object.updated_at,
                ],
            )?;
        }
    }
    Ok(())
}

fn delete_object(tx: &Transaction<'_>, id: &ObjectId) -> rusqlite::Result<()> {
    let Some(key) = id.as_durable() else {
        return Ok(());
    };
    tx.execute("DELETE FROM objects WHERE id = ?1", [key])?;
    tx.execute(
        "INSERT OR REPLACE INTO tombstones (id, deleted_at) VALUES (?1, ?2)",
        rusqlite::params![key, chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

fn parse_properties(raw: &str) -> Map<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn config_for(path: &Path) -> StoreConfig {
        StoreConfig::new().with_path(path)
    }

    fn durable_object(entity: &str, pairs: &[(&str, Value)]) -> ManagedObject {
        let mut object = ManagedObject::new(
            entity,
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        );
        object.id = ObjectId::durable();
        object
    }

    #[test]
    fn test_open_creates_store_at_current_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quill.sqlite");
        let store = StoreCoordinator::open(&config_for(&path)).unwrap();

        assert!(path.exists());
        assert_eq!(store.path(), path);

        let conn = Connection::open(&path).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 4);
    }

    #[test]
    fn test_save_and_fetch_roundtrip() {
        let dir = tempdir().unwrap();
        let store =
            StoreCoordinator::open(&config_for(&dir.path().join("quill.sqlite"))).unwrap();

        let object = durable_object("post", &[("title", json!("Hello"))]);
        store.save_objects("main", &[object.clone()], &[]).unwrap();

        let fetched = store.fetch(&object.id).unwrap().unwrap();
        assert_eq!(fetched.entity, "post");
        assert_eq!(fetched.properties["title"], json!("Hello"));
    }

    #[test]
    fn test_upsert_merges_properties_incoming_wins() {
        let dir = tempdir().unwrap();
        let store =
            StoreCoordinator::open(&config_for(&dir.path().join("quill.sqlite"))).unwrap();

        let mut object = durable_object(
            "post",
            &[("title", json!("Old")), ("status", json!("draft"))],
        );
        store.save_objects("main", &[object.clone()], &[]).unwrap();

        // A later save carrying only the changed property.
        object.properties = std::iter::once(("title".to_string(), json!("New"))).collect();
        store.save_objects("main", &[object.clone()], &[]).unwrap();

        let fetched = store.fetch(&object.id).unwrap().unwrap();
        assert_eq!(fetched.properties["title"], json!("New"));
        assert_eq!(fetched.properties["status"], json!("draft"));
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quill.sqlite");
        let store = StoreCoordinator::open(&config_for(&path)).unwrap();

        let object = durable_object("post", &[]);
        store.save_objects("main", &[object.clone()], &[]).unwrap();
        store.save_objects("main", &[], &[object.id.clone()]).unwrap();

        assert!(store.fetch(&object.id).unwrap().is_none());

        let conn = Connection::open(&path).unwrap();
        let tombstones: i64 = conn
            .query_row("SELECT COUNT(*) FROM tombstones", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tombstones, 1);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quill.sqlite");
        let object = durable_object("post", &[("title", json!("Kept"))]);
        {
            let store = StoreCoordinator::open(&config_for(&path)).unwrap();
            store.save_objects("main", &[object.clone()], &[]).unwrap();
        }

        // Compatible store: no migration, no backup, data intact.
        let store = StoreCoordinator::open(&config_for(&path)).unwrap();
        assert!(!locator::backup_path(&path).exists());
        let fetched = store.fetch(&object.id).unwrap().unwrap();
        assert_eq!(fetched.properties["title"], json!("Kept"));
    }

    #[test]
    fn test_fetch_temporary_id_is_none() {
        let dir = tempdir().unwrap();
        let store =
            StoreCoordinator::open(&config_for(&dir.path().join("quill.sqlite"))).unwrap();
        assert!(store.fetch(&ObjectId::temporary()).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_store_is_backed_up_and_recreated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quill.sqlite");
        std::fs::write(&path, b"this is not a database").unwrap();

        let store = StoreCoordinator::open(&config_for(&path)).unwrap();

        let backup = locator::backup_path(&path);
        assert!(backup.exists());
        assert_eq!(
            std::fs::read(&backup).unwrap(),
            b"this is not a database".to_vec()
        );
        // The recreated store is empty and usable.
        assert!(store.fetch(&ObjectId::durable()).unwrap().is_none());
    }

    #[test]
    fn test_newer_store_is_not_recreated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quill.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }

        let err = StoreCoordinator::open(&config_for(&path)).unwrap_err();
        assert!(matches!(err, Error::NewerSchema { .. }));
        assert!(!locator::backup_path(&path).exists());
    }

    #[test]
    fn test_double_open_failure_invokes_fatal_hook() {
        let dir = tempdir().unwrap();
        // A directory where the store file should be: the open fails and
        // the backup copy fails too.
        let path = dir.path().join("quill.sqlite");
        std::fs::create_dir(&path).unwrap();

        let (tx, rx) = mpsc::channel();
        let config = config_for(&path).with_fatal_hook(move |err| {
            let _ = tx.send(err.to_string());
        });

        let result = StoreCoordinator::open(&config);
        assert!(result.is_err());
        let fault = rx.try_recv().expect("fatal hook should have fired");
        assert!(!fault.is_empty());
    }

    #[test]
    fn test_save_failure_is_typed_and_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quill.sqlite");
        let store = StoreCoordinator::open(&config_for(&path)).unwrap();

        // Sabotage the schema through a second connection.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("DROP TABLE objects;").unwrap();
        }

        let err = store
            .save_objects("main", &[durable_object("post", &[])], &[])
            .unwrap_err();
        assert!(matches!(err, Error::SaveFailed { .. }));
        assert!(err.is_recoverable());
    }
}
