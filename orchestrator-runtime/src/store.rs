use std::path::{Path, PathBuf};

pub use blueprint_sdk::stores::local_database::{Error as StoreError, LocalDatabase};

use crate::error::{OrchestratorError, Result};

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        OrchestratorError::Storage(err.to_string())
    }
}

/// Create the state directory with restrictive permissions (0o700) if it doesn't exist.
pub fn ensure_state_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|err| {
            OrchestratorError::Storage(format!(
                "Failed to create state dir {}: {err}",
                dir.display()
            ))
        })?;
        // Restrict directory permissions: only owner can read/write/traverse.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }
    Ok(())
}

/// Convenience wrapper that bridges `LocalDatabase` to our `OrchestratorError` types.
///
/// The control plane only keeps singleton records, so most stores hold a
/// single well-known key.
pub struct PersistentStore<V> {
    db: LocalDatabase<V>,
}

impl<V> PersistentStore<V>
where
    V: serde::Serialize + serde::de::DeserializeOwned + Clone,
{
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_state_dir(parent)?;
        }
        let db = LocalDatabase::open(path)?;
        Ok(Self { db })
    }

    /// Open `file_name` inside `dir`.
    pub fn open_in(dir: &Path, file_name: &str) -> Result<Self> {
        Self::open(dir.join(file_name))
    }

    pub fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.db.get(key)?)
    }

    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.db.values()?)
    }

    pub fn insert(&self, key: String, value: V) -> Result<()> {
        Ok(self.db.set(&key, value)?)
    }

    pub fn remove(&self, key: &str) -> Result<Option<V>> {
        Ok(self.db.remove(key)?)
    }

    pub fn replace(&self, map: std::collections::HashMap<String, V>) -> Result<()> {
        Ok(self.db.replace(map)?)
    }
}
