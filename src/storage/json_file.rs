//! One-file-per-key JSON storage.
//!
//! Keys are percent-encoded into file names (`<key>.json`) so arbitrary storage keys
//! cannot escape the data directory. Writes take an exclusive lock on the destination,
//! write a sibling temp file, fsync it and atomically rename it over the target.

use async_trait::async_trait;
use fs2::FileExt;
use log::{debug, warn};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{StorageAdapter, StorageError, StorageResult};

const EXTENSION: &str = "json";

pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        let name = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        Ok(self.dir.join(format!("{}.{}", name, EXTENSION)))
    }
}

/// Replace `path` with `content` under an exclusive lock, via temp file + rename.
fn write_file_locked(path: &Path, content: &[u8]) -> StorageResult<()> {
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    lock_file.lock_exclusive()?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("store.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content)?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(e.into()),
        }
    };

    fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    drop(lock_file);
    Ok(())
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {}", e)))?
}

#[async_trait]
impl StorageAdapter for JsonFileStorage {
    async fn init(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        debug!("json storage ready at {}", self.dir.display());
        Ok(())
    }

    async fn save(&self, key: &str, blob: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(key)?;
        blocking(move || write_file_locked(&path, &blob)).await
    }

    async fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            // An interrupted first write can leave an empty lock file behind
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> StorageResult<()> {
        for key in self.list_keys().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(&format!(".{}", EXTENSION)) else {
                continue;
            };
            match percent_decode_str(stem).decode_utf8() {
                Ok(key) => keys.push(key.into_owned()),
                Err(_) => warn!("skipping undecodable storage file {}", name),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
