//! Server-side document storage.
//!
//! Each user's collections are stored as JSON files:
//! ```text
//! <DATA_DIR>/
//!   <user_id>/
//!     meal_logs.json
//!     weights.json
//! ```
//!
//! Files are replaced atomically (temp file, fsync, rename).

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

use crate::models::SyncableDocument;

#[derive(Debug, Error)]
pub enum ServerStorageError {
    #[error("I/O error for {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] io::Error),

    #[error("Failed to parse {}: {}", .0.display(), .1)]
    Corrupt(PathBuf, String),

    #[error("Invalid user ID: {0}")]
    InvalidUserId(String),

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),
}

#[derive(Debug, Clone)]
pub struct ServerStorage {
    data_dir: PathBuf,
}

impl ServerStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Rejects names that could escape the data directory.
    fn validate_segment(name: &str) -> bool {
        !(name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
            || name.starts_with('.'))
    }

    fn validate_user_id(user_id: &str) -> Result<(), ServerStorageError> {
        if Self::validate_segment(user_id) {
            Ok(())
        } else {
            Err(ServerStorageError::InvalidUserId(user_id.to_string()))
        }
    }

    fn validate_collection(collection: &str) -> Result<(), ServerStorageError> {
        let charset_ok = collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if Self::validate_segment(collection) && charset_ok {
            Ok(())
        } else {
            Err(ServerStorageError::InvalidCollection(collection.to_string()))
        }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.data_dir.join(user_id)
    }

    fn collection_path(&self, user_id: &str, collection: &str) -> PathBuf {
        self.user_dir(user_id).join(format!("{}.json", collection))
    }

    /// Loads a collection. A missing file is an empty collection.
    pub fn load_collection(
        &self,
        user_id: &str,
        collection: &str,
    ) -> Result<Vec<SyncableDocument>, ServerStorageError> {
        Self::validate_user_id(user_id)?;
        Self::validate_collection(collection)?;

        let path = self.collection_path(user_id, collection);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ServerStorageError::Corrupt(path, e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ServerStorageError::Io(path, e)),
        }
    }

    pub fn save_collection(
        &self,
        user_id: &str,
        collection: &str,
        docs: &[SyncableDocument],
    ) -> Result<(), ServerStorageError> {
        Self::validate_user_id(user_id)?;
        Self::validate_collection(collection)?;

        let user_dir = self.user_dir(user_id);
        let path = self.collection_path(user_id, collection);

        fs::create_dir_all(&user_dir).map_err(|e| ServerStorageError::Io(user_dir.clone(), e))?;

        let bytes = serde_json::to_vec(docs)
            .map_err(|e| ServerStorageError::Corrupt(path.clone(), e.to_string()))?;

        let temp_path = path.with_extension("json.tmp");
        let mut file =
            File::create(&temp_path).map_err(|e| ServerStorageError::Io(temp_path.clone(), e))?;
        file.write_all(&bytes)
            .map_err(|e| ServerStorageError::Io(temp_path.clone(), e))?;
        file.sync_all()
            .map_err(|e| ServerStorageError::Io(temp_path.clone(), e))?;

        fs::rename(&temp_path, &path).map_err(|e| ServerStorageError::Io(path, e))?;

        Ok(())
    }

    /// Names of the collections stored for a user, sorted.
    pub fn list_collections(&self, user_id: &str) -> Result<Vec<String>, ServerStorageError> {
        Self::validate_user_id(user_id)?;

        let dir = self.user_dir(user_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServerStorageError::Io(dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ServerStorageError::Io(dir.clone(), e))?;
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) {
                if Self::validate_collection(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::epoch_plus_secs;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (ServerStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = ServerStorage::new(temp_dir.path());
        (storage, temp_dir)
    }

    fn doc(id: &str, version: u64) -> SyncableDocument {
        SyncableDocument {
            collection: "weights".to_string(),
            id: id.to_string(),
            version,
            updated_at: epoch_plus_secs(version as i64),
            deleted_at: None,
            last_writer_device: "device-a".to_string(),
            payload: json!({"kilograms": 80}),
        }
    }

    #[test]
    fn test_validate_names() {
        assert!(ServerStorage::validate_user_id("alice").is_ok());
        assert!(ServerStorage::validate_user_id("user_123").is_ok());
        assert!(ServerStorage::validate_user_id("").is_err());
        assert!(ServerStorage::validate_user_id("../evil").is_err());
        assert!(ServerStorage::validate_user_id("foo/bar").is_err());
        assert!(ServerStorage::validate_user_id("foo\\bar").is_err());
        assert!(ServerStorage::validate_user_id(".hidden").is_err());

        assert!(ServerStorage::validate_collection("meal_logs").is_ok());
        assert!(ServerStorage::validate_collection("meal logs").is_err());
        assert!(ServerStorage::validate_collection("x.json").is_err());
    }

    #[test]
    fn test_load_missing_collection_is_empty() {
        let (storage, _temp) = setup();
        assert!(storage.load_collection("alice", "weights").unwrap().is_empty());
        assert!(storage.list_collections("alice").unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let (storage, temp) = setup();
        storage
            .save_collection("alice", "weights", &[doc("w1", 1), doc("w2", 3)])
            .unwrap();

        let loaded = storage.load_collection("alice", "weights").unwrap();
        assert_eq!(loaded, vec![doc("w1", 1), doc("w2", 3)]);

        assert!(temp.path().join("alice").join("weights.json").exists());
        assert!(!temp.path().join("alice").join("weights.json.tmp").exists());
        assert_eq!(storage.list_collections("alice").unwrap(), vec!["weights"]);
    }

    #[test]
    fn test_users_are_isolated() {
        let (storage, _temp) = setup();
        storage
            .save_collection("alice", "weights", &[doc("w1", 1)])
            .unwrap();

        assert!(storage.load_collection("bob", "weights").unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let (storage, temp) = setup();
        let dir = temp.path().join("alice");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("weights.json"), b"{not json").unwrap();

        let result = storage.load_collection("alice", "weights");
        assert!(matches!(result, Err(ServerStorageError::Corrupt(_, _))));
    }
}
