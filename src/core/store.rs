//! Key-value persistence backends.
//!
//! The shared medium offers plain `get`/`set`/`remove` on string values and
//! nothing else: no transactions and no compare-and-swap. Everything above it
//! (run documents, lead collections, the advisory mutex) is built from
//! whole-value reads and writes.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

/// Errors raised by a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage capacity exceeded writing '{key}': {size} bytes > {limit} bytes")]
    CapacityExceeded { key: String, size: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A shared string-keyed store without atomic primitives
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Read a value, `None` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replace a value (last writer wins)
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a value; deleting an absent key is not an error
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

fn check_capacity(key: &str, value: &str, limit: Option<usize>) -> Result<(), StorageError> {
    match limit {
        Some(limit) if value.len() > limit => Err(StorageError::CapacityExceeded {
            key: key.to_string(),
            size: value.len(),
            limit,
        }),
        _ => Ok(()),
    }
}

/// Directory-backed store, one file per key
///
/// Several processes may point at the same directory. Values are written to a
/// temporary sibling and renamed into place, so a reader sees either the old
/// or the new value, never a torn one.
pub struct FileStore {
    root: PathBuf,
    max_value_bytes: Option<usize>,
}

impl FileStore {
    /// Open (and create) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            max_value_bytes: None,
        })
    }

    /// Reject values larger than `limit` bytes
    pub fn with_max_value_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_value_bytes = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        check_capacity(key, value, self.max_value_bytes)?;

        let root = self.root.clone();
        let path = self.path_for(key);
        let value = value.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            tmp.write_all(value.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store; clones share the same underlying map
///
/// Useful for embedding and for modelling several application instances
/// that share one medium.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
    max_value_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject values larger than `limit` bytes
    pub fn with_max_value_bytes(mut self, limit: usize) -> Self {
        self.max_value_bytes = Some(limit);
        self
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        check_capacity(key, value, self.max_value_bytes)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
