//! Key/value storage capability.

use crate::PaywardenError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Lifetime of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScope {
    /// Lives as long as the browsing session.
    Session,
    /// Survives across sessions.
    Local,
}

/// Key/value storage with session and persistent scopes.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a value, `None` if absent.
    async fn get(&self, key: &str, scope: StorageScope) -> Result<Option<String>, PaywardenError>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str, scope: StorageScope)
        -> Result<(), PaywardenError>;

    /// Remove a value. Removing an absent key is not an error.
    async fn remove(&self, key: &str, scope: StorageScope) -> Result<(), PaywardenError>;
}

/// Process-local storage. Both scopes live in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<(StorageScope, String), String>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values across both scopes.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str, scope: StorageScope) -> Result<Option<String>, PaywardenError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(scope, key.to_string()))
            .cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        scope: StorageScope,
    ) -> Result<(), PaywardenError> {
        self.entries
            .write()
            .await
            .insert((scope, key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str, scope: StorageScope) -> Result<(), PaywardenError> {
        self.entries.write().await.remove(&(scope, key.to_string()));
        Ok(())
    }
}
