//! In-memory storage backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{StorageAdapter, StorageResult};

/// HashMap-backed storage. Not persistent; cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn save(&self, key: &str, blob: Vec<u8>) -> StorageResult<()> {
        self.data.write().await.insert(key.to_string(), blob);
        Ok(())
    }

    async fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.data.write().await.clear();
        Ok(())
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self.data.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
