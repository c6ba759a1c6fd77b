//! # Storage Module - Durable Blob Persistence
//!
//! The messaging core persists its store registry through the [`StorageAdapter`]
//! trait: an async key/blob contract with no knowledge of message types. The
//! store manager is the only caller; stores never touch storage directly.
//!
//! ## Backends
//!
//! - [`MemoryStorage`] - process-local map, always available (tests, ephemeral sessions)
//! - [`SledStorage`] - embedded sled tree (`sled-backend` feature)
//! - [`JsonFileStorage`] - one JSON file per key with locked atomic replace (`json-backend` feature)
//!
//! ## Configuration
//!
//! ```toml
//! [storage]
//! backend = "sled"     # memory | sled | json
//! data_dir = "./data"
//! ```
//!
//! ## Error Handling
//!
//! Every backend reports [`StorageError`]. Callers in the messaging core treat these
//! as recoverable: they are logged and the in-memory session continues.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};

#[cfg(feature = "json-backend")]
pub mod json_file;
pub mod memory;
#[cfg(feature = "sled-backend")]
pub mod sled_store;

#[cfg(feature = "json-backend")]
pub use json_file::JsonFileStorage;
pub use memory::MemoryStorage;
#[cfg(feature = "sled-backend")]
pub use sled_store::SledStorage;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sled-backend")]
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation was attempted before `init()` succeeded.
    #[error("storage backend not initialised")]
    NotInitialised,

    /// The configured backend was not compiled into this build.
    #[error("storage backend '{0}' is not available in this build")]
    Unavailable(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Async key/blob persistence contract.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepare the backend (open files, create directories). Idempotent.
    async fn init(&self) -> StorageResult<()>;

    /// Store `blob` under `key`, replacing any previous value.
    async fn save(&self, key: &str, blob: Vec<u8>) -> StorageResult<()>;

    /// Fetch the blob stored under `key`, if any.
    async fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Remove `key`. Succeeds when the key is absent.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Remove every key.
    async fn clear(&self) -> StorageResult<()>;

    async fn list_keys(&self) -> StorageResult<Vec<String>>;
}

/// Build the backend selected in `[storage]`.
pub fn open_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageAdapter>> {
    let dir = Path::new(&config.data_dir);
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        #[cfg(feature = "sled-backend")]
        StorageBackend::Sled => Ok(Arc::new(SledStorage::new(dir.join("messages.sled")))),
        #[cfg(feature = "json-backend")]
        StorageBackend::Json => Ok(Arc::new(JsonFileStorage::new(dir.join("messages")))),
        #[allow(unreachable_patterns)]
        other => {
            let _ = dir;
            Err(StorageError::Unavailable(other.to_string()))
        }
    }
}
