//! Store location resolution.
//!
//! The entire object graph lives in a single SQLite file. Resolution
//! priority:
//!
//! 1. Explicit path from [`StoreConfig`](crate::storage::StoreConfig)
//! 2. `QUILLSTORE_TEST_DB` test mode → isolated test location
//! 3. `QUILLSTORE_DB` environment variable
//! 4. Per-user data directory: `<data-dir>/quill/quill.sqlite`

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// File name of the store.
pub const STORE_FILE_NAME: &str = "quill.sqlite";

/// Get the per-user quill data directory.
#[must_use]
pub fn data_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.data_dir().join("quill"))
}

/// Check if test mode is enabled.
///
/// Test mode is enabled by setting `QUILLSTORE_TEST_DB` to any value other
/// than empty, `0`, or `false`. It redirects the store to an isolated
/// location so production data stays safe during development.
#[must_use]
pub fn is_test_mode() -> bool {
    std::env::var("QUILLSTORE_TEST_DB")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the test store path (`<data-dir>/quill/test/quill.sqlite`).
#[must_use]
pub fn test_store_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("test").join(STORE_FILE_NAME))
}

/// Resolve the store file path.
///
/// # Errors
///
/// Returns [`Error::StoreLocation`] when no per-user data directory can be
/// determined and neither an explicit path nor an environment override is
/// set.
pub fn resolve_store_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if is_test_mode() {
        return test_store_path()
            .ok_or_else(|| Error::StoreLocation("no data directory for test store".to_string()));
    }

    if let Ok(path) = std::env::var("QUILLSTORE_DB") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    data_dir()
        .map(|dir| dir.join(STORE_FILE_NAME))
        .ok_or_else(|| Error::StoreLocation("no data directory".to_string()))
}

/// Sibling path the corrupt store is copied to before recreation.
///
/// `quill.sqlite` becomes `quill.sqlite~` next to the original.
#[must_use]
pub fn backup_path(store: &Path) -> PathBuf {
    let mut name = store
        .file_name()
        .map_or_else(|| STORE_FILE_NAME.into(), std::ffi::OsStr::to_os_string);
    name.push("~");
    store.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_with_explicit_path() {
        let explicit = PathBuf::from("/custom/path/graph.sqlite");
        let result = resolve_store_path(Some(&explicit)).unwrap();
        assert_eq!(result, explicit);
    }

    #[test]
    fn test_default_path_ends_with_store_file() {
        let path = resolve_store_path(None).unwrap();
        assert!(path.ends_with(STORE_FILE_NAME));
    }

    #[test]
    fn test_test_store_path_is_separate() {
        let default = data_dir().unwrap().join(STORE_FILE_NAME);
        let test = test_store_path().unwrap();
        assert!(test.to_string_lossy().contains("/test/"));
        assert_ne!(default, test);
    }

    #[test]
    fn test_backup_path_appends_tilde() {
        let store = PathBuf::from("/data/quill/quill.sqlite");
        assert_eq!(
            backup_path(&store),
            PathBuf::from("/data/quill/quill.sqlite~")
        );
    }
}
