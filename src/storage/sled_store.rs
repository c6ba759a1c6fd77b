use async_trait::async_trait;
use log::debug;
use std::path::PathBuf;
use tokio::sync::OnceCell;

use super::{StorageAdapter, StorageError, StorageResult};

const TREE_STORES: &str = "message_stores";

/// Sled-backed persistence. The database is opened lazily by [`StorageAdapter::init`].
pub struct SledStorage {
    path: PathBuf,
    tree: OnceCell<sled::Tree>,
}

impl SledStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tree: OnceCell::new(),
        }
    }

    fn tree(&self) -> StorageResult<sled::Tree> {
        self.tree.get().cloned().ok_or(StorageError::NotInitialised)
    }
}

#[async_trait]
impl StorageAdapter for SledStorage {
    async fn init(&self) -> StorageResult<()> {
        // sled allows one open per directory; concurrent callers share this one
        self.tree
            .get_or_try_init(|| async {
                let path = self.path.clone();
                let tree = tokio::task::spawn_blocking(move || -> StorageResult<sled::Tree> {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let db = sled::open(&path)?;
                    Ok(db.open_tree(TREE_STORES)?)
                })
                .await
                .map_err(|e| StorageError::Backend(format!("blocking task failed: {}", e)))??;
                debug!("sled storage opened at {}", self.path.display());
                Ok::<_, StorageError>(tree)
            })
            .await?;
        Ok(())
    }

    async fn save(&self, key: &str, blob: Vec<u8>) -> StorageResult<()> {
        let tree = self.tree()?;
        tree.insert(key.as_bytes(), blob)?;
        tree.flush_async().await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let tree = self.tree()?;
        Ok(tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let tree = self.tree()?;
        tree.remove(key.as_bytes())?;
        tree.flush_async().await?;
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        let tree = self.tree()?;
        tree.clear()?;
        tree.flush_async().await?;
        Ok(())
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let tree = self.tree()?;
        let mut keys = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}
