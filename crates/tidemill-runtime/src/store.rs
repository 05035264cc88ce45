//! Durable key-value state for pipeline progress.
//!
//! Stage cursors and connector file progress are tiny JSON documents keyed by
//! colon-separated names (`cursor:silver_cleaned:bronze_transactions`). The
//! [`StateStore`] trait abstracts where they live: [`MemoryStore`] for tests
//! and ephemeral runs, [`FileStore`] for pipelines that must resume after a
//! restart.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Key-value persistence used for cursors and connector progress.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Load and decode a JSON document from a store.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Codec(key.to_string(), e.to_string())),
        None => Ok(None),
    }
}

/// Encode and persist a JSON document into a store.
pub fn save_json<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)
        .map_err(|e| StoreError::Codec(key.to_string(), e.to_string()))?;
    store.put(key, &raw)
}

/// In-memory store. State vanishes with the process.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.keys().cloned().collect())
    }
}

/// File-backed store: one JSON file per key under a root directory.
///
/// Colons in keys map to path separators, so `cursor:silver:bronze` lands at
/// `<root>/cursor/silver/bronze.json`. Writes go through a temp file and an
/// atomic rename; a crash mid-write leaves the previous value intact.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::Io(root.clone(), e.to_string()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        let mut parts = key.split(':').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_some() {
                path.push(sanitize(part));
            } else {
                // Append rather than set_extension: key parts may contain dots
                path.push(format!("{}.json", sanitize(part)));
            }
        }
        path
    }
}

/// Keep key parts filesystem-safe without losing uniqueness for sane names.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(path, e.to_string())),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(parent.to_path_buf(), e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).map_err(|e| StoreError::Io(tmp.clone(), e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::Io(path, e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(path, e.to_string())),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        collect_keys(&self.root, String::new(), &mut keys)
            .map_err(|e| StoreError::Io(self.root.clone(), e.to_string()))?;
        Ok(keys)
    }
}

fn collect_keys(dir: &Path, prefix: String, out: &mut Vec<String>) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if path.is_dir() {
            let next = if prefix.is_empty() { name } else { format!("{prefix}:{name}") };
            collect_keys(&path, next, out)?;
        } else if let Some(stem) = name.strip_suffix(".json") {
            let key = if prefix.is_empty() {
                stem.to_string()
            } else {
                format!("{prefix}:{stem}")
            };
            out.push(key);
        }
    }
    Ok(())
}

/// Store failure.
#[derive(Debug)]
pub enum StoreError {
    /// Filesystem problem at a path.
    Io(PathBuf, String),
    /// A stored document did not decode, or a value did not encode.
    Codec(String, String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(path, msg) => write!(f, "store I/O error at {}: {}", path.display(), msg),
            StoreError::Codec(key, msg) => write!(f, "store codec error for key '{key}': {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}
