//! JSON file-backed key-value store.
//!
//! The whole map lives in one JSON object on disk. Every write rewrites the
//! file through a temp file in the same directory followed by an atomic
//! rename, so a crash mid-write leaves the previous contents intact.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use iapkit_purchasing::{KeyValueStore, StoreError};

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt store file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

impl From<FileStoreError> for StoreError {
    fn from(err: FileStoreError) -> Self {
        StoreError::unavailable(err.to_string())
    }
}

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, bool>>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating parent directories as needed.
    /// A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
        let path = path.into();
        let dir = parent_dir(&path);
        fs::create_dir_all(dir).map_err(|source| FileStoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| FileStoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(FileStoreError::Io { path, source }),
        };
        debug!(path = %path.display(), keys = entries.len(), "opened key-value store");

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(&self, entries: &BTreeMap<String, bool>) -> Result<(), FileStoreError> {
        let dir = parent_dir(&self.path);
        let io_err = |source| FileStoreError::Io {
            path: self.path.clone(),
            source,
        };

        let body = serde_json::to_vec_pretty(entries).map_err(|source| FileStoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let mut temp_file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        temp_file.write_all(&body).map_err(io_err)?;
        temp_file.as_file().sync_all().map_err(io_err)?;
        temp_file
            .persist(&self.path)
            .map_err(|source| FileStoreError::Persist {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).copied())
    }

    /// The in-memory map is only updated once the file write succeeded.
    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        if entries.get(key) == Some(&value) {
            return Ok(());
        }

        let mut next = entries.clone();
        next.insert(key.to_string(), value);
        self.write_atomic(&next)?;
        *entries = next;
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}
