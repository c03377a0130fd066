//! Client-local key/value storage kept as one JSON file per key.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::repository::errors::StorageError;
use crate::usecase::contracts::LocalStorage;

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Creates the storage directory if needed; a read-only directory is
    /// reported as unavailable.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        if fs::metadata(&root)?.permissions().readonly() {
            return Err(StorageError::Unavailable(format!(
                "{} is read-only",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.json", name))
    }
}

/// Opens `FileStorage` at `root`, or falls back to `UnavailableStorage` so the
/// service still starts with read state kept in memory only.
pub fn open_or_unavailable(root: impl Into<PathBuf>) -> Arc<dyn LocalStorage> {
    let root = root.into();
    match FileStorage::open(&root) {
        Ok(storage) => {
            tracing::info!(storage_dir = %storage.root().display(), "local storage opened");
            Arc::new(storage)
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                storage_dir = %root.display(),
                "local storage unavailable, read state will not persist"
            );
            Arc::new(UnavailableStorage {
                reason: e.to_string(),
            })
        }
    }
}

/// Every call fails with `StorageError::Unavailable`.
#[derive(Debug, Clone)]
pub struct UnavailableStorage {
    reason: String,
}

impl LocalStorage for UnavailableStorage {
    fn get_item(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable(self.reason.clone()))
    }

    fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable(self.reason.clone()))
    }
}

impl LocalStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes to a temporary file and renames it over the target so readers
    /// never observe a partial value.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        tracing::trace!(key, path = %path.display(), "local storage item written");
        Ok(())
    }
}
