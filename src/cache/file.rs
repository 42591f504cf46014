//! File-based storage backend with atomic writes.
//!
//! Local-scope values live under `dirs::data_dir()/<namespace>/`, one file per
//! key, named by a hash of the key. Session-scope values are kept in memory
//! and die with the process.
//! Uses temp file + rename for atomic writes.

use crate::cache::storage::{MemoryStorage, Storage, StorageScope};
use crate::crypto::digest::hash_storage_key;
use crate::PaywardenError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

/// File-based storage backend.
pub struct FileStorage {
    /// Directory for local-scope files.
    storage_dir: PathBuf,
    /// Session-scope values.
    session: MemoryStorage,
}

impl FileStorage {
    /// Create a file store with the given namespace.
    ///
    /// Files are stored under `dirs::data_dir()/<namespace>/`.
    pub fn new(namespace: &str) -> Result<Self, PaywardenError> {
        let base_dir = dirs::data_dir().ok_or_else(|| {
            PaywardenError::StorageIO("Could not find data directory".to_string())
        })?;
        Self::with_path(base_dir.join(namespace))
    }

    /// Create a file store rooted at a specific directory.
    pub fn with_path(storage_dir: PathBuf) -> Result<Self, PaywardenError> {
        std::fs::create_dir_all(&storage_dir).map_err(|e| {
            PaywardenError::StorageIO(format!("Failed to create storage dir: {}", e))
        })?;
        Ok(Self {
            storage_dir,
            session: MemoryStorage::new(),
        })
    }

    /// Path of the file holding `key`.
    fn key_path(&self, key: &str) -> PathBuf {
        let hash = hash_storage_key(key);
        self.storage_dir.join(format!("{}.val", &hash[..16]))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str, scope: StorageScope) -> Result<Option<String>, PaywardenError> {
        if scope == StorageScope::Session {
            return self.session.get(key, scope).await;
        }

        match fs::read_to_string(self.key_path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PaywardenError::StorageIO(format!(
                "Failed to read value: {}",
                e
            ))),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        scope: StorageScope,
    ) -> Result<(), PaywardenError> {
        if scope == StorageScope::Session {
            return self.session.set(key, value, scope).await;
        }

        let target_path = self.key_path(key);
        let temp_path = target_path.with_extension("tmp");

        fs::write(&temp_path, value)
            .await
            .map_err(|e| PaywardenError::StorageIO(format!("Failed to write temp file: {}", e)))?;

        fs::rename(&temp_path, &target_path)
            .await
            .map_err(|e| PaywardenError::StorageIO(format!("Failed to rename value file: {}", e)))
    }

    async fn remove(&self, key: &str, scope: StorageScope) -> Result<(), PaywardenError> {
        if scope == StorageScope::Session {
            return self.session.remove(key, scope).await;
        }

        match fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PaywardenError::StorageIO(format!(
                "Failed to delete value: {}",
                e
            ))),
        }
    }
}
