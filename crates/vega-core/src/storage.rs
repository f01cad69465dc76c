//! Persistent storage for device configurations.
//!
//! The registry talks to a [`DeviceStore`]. [`JsonDeviceStore`] keeps the whole
//! list in one JSON file; [`MemoryDeviceStore`] keeps it in memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::config::{DeviceConfig, DeviceId};

/// File name of the device list inside the data directory.
pub const DEVICES_FILE: &str = "devices.json";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading the store failed.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the store failed.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The stored data is not a device list.
    #[error("Failed to parse {}: {source}", path.display())]
    ParseError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The device list could not be encoded.
    #[error("Failed to serialize devices: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// No platform data directory is available.
    #[error("Cannot determine data directory")]
    NoDataDir,
}

/// Result type for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Where device configurations are kept.
pub trait DeviceStore: Send + Sync {
    /// All stored devices, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn list(&self) -> StoreResult<Vec<DeviceConfig>>;

    /// One device by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get(&self, id: DeviceId) -> StoreResult<Option<DeviceConfig>> {
        Ok(self.list()?.into_iter().find(|d| d.id == id))
    }

    /// Inserts or replaces a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn save(&self, device: &DeviceConfig) -> StoreResult<()>;

    /// Removes a device. Returns `false` if it was not stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn remove(&self, id: DeviceId) -> StoreResult<bool>;
}

type DeviceMap = BTreeMap<DeviceId, DeviceConfig>;

fn write_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::WriteError { path, source }
}

fn sorted(map: &DeviceMap) -> Vec<DeviceConfig> {
    let mut devices: Vec<DeviceConfig> = map.values().cloned().collect();
    devices.sort_by_key(|d| (d.created_at, d.id));
    devices
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<DeviceMap>,
}

impl MemoryDeviceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `devices`.
    #[must_use]
    pub fn with_devices(devices: impl IntoIterator<Item = DeviceConfig>) -> Self {
        Self {
            devices: Mutex::new(devices.into_iter().map(|d| (d.id, d)).collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceMap> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn list(&self) -> StoreResult<Vec<DeviceConfig>> {
        Ok(sorted(&self.lock()))
    }

    fn get(&self, id: DeviceId) -> StoreResult<Option<DeviceConfig>> {
        Ok(self.lock().get(&id).cloned())
    }

    fn save(&self, device: &DeviceConfig) -> StoreResult<()> {
        self.lock().insert(device.id, device.clone());
        Ok(())
    }

    fn remove(&self, id: DeviceId) -> StoreResult<bool> {
        Ok(self.lock().remove(&id).is_some())
    }
}

/// Device list persisted as one JSON file.
///
/// Every mutation rewrites the file through a temporary sibling and a rename,
/// so a crash never leaves a truncated list behind.
#[derive(Debug)]
pub struct JsonDeviceStore {
    path: PathBuf,
    // serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl JsonDeviceStore {
    /// Store backed by `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store backed by [`DEVICES_FILE`] inside `data_dir`.
    #[must_use]
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(DEVICES_FILE))
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> StoreResult<DeviceMap> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DeviceMap::new()),
            Err(source) => {
                return Err(StoreError::ReadError {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let devices: Vec<DeviceConfig> =
            serde_json::from_str(&content).map_err(|source| StoreError::ParseError {
                path: self.path.clone(),
                source,
            })?;
        Ok(devices.into_iter().map(|d| (d.id, d)).collect())
    }

    fn write_map(&self, map: &DeviceMap) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err(parent))?;
        }
        let content = serde_json::to_string_pretty(&sorted(map))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(write_err(&tmp))?;
        std::fs::rename(&tmp, &self.path).map_err(write_err(&self.path))?;
        Ok(())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut DeviceMap) -> T) -> StoreResult<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        let out = f(&mut map);
        self.write_map(&map)?;
        Ok(out)
    }
}

impl DeviceStore for JsonDeviceStore {
    fn list(&self) -> StoreResult<Vec<DeviceConfig>> {
        Ok(sorted(&self.read_map()?))
    }

    fn save(&self, device: &DeviceConfig) -> StoreResult<()> {
        tracing::debug!(device_id = %device.id, path = %self.path.display(), "saving device");
        self.modify(|map| {
            map.insert(device.id, device.clone());
        })
    }

    fn remove(&self, id: DeviceId) -> StoreResult<bool> {
        self.modify(|map| map.remove(&id).is_some())
    }
}

/// Default data directory.
///
/// On Linux: `/var/lib/vega/`.
/// Elsewhere: the platform data directory.
///
/// # Errors
///
/// [`StoreError::NoDataDir`] if the platform directory cannot be determined.
pub fn default_data_dir() -> StoreResult<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/var/lib/vega"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "vega").ok_or(StoreError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}

/// Default device list path.
///
/// # Errors
///
/// See [`default_data_dir`].
pub fn default_devices_path() -> StoreResult<PathBuf> {
    Ok(default_data_dir()?.join(DEVICES_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn DeviceStore) {
        let a = DeviceConfig::new("AA:BB:CC:DD:EE:01", "A");
        let b = DeviceConfig::new("AA:BB:CC:DD:EE:02", "B");
        store.save(&a).unwrap();
        store.save(&b).unwrap();
        assert_eq!(store.list().unwrap(), vec![a.clone(), b.clone()]);

        let renamed = a.clone().with_name("A2");
        store.save(&renamed).unwrap();
        assert_eq!(store.get(a.id).unwrap(), Some(renamed));
        assert_eq!(store.list().unwrap().len(), 2);

        assert!(store.remove(b.id).unwrap());
        assert!(!store.remove(b.id).unwrap());
        assert_eq!(store.get(b.id).unwrap(), None);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryDeviceStore::new());
    }

    #[test]
    fn test_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDeviceStore::in_dir(&dir.path().join("data"));
        assert!(store.list().unwrap().is_empty());
        exercise(&store);

        // survives a reopen, no temp file left behind
        let reopened = JsonDeviceStore::in_dir(&dir.path().join("data"));
        assert_eq!(reopened.list().unwrap().len(), 1);
        assert!(!dir.path().join("data").join("devices.json.tmp").exists());
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonDeviceStore::new(&path);
        assert!(matches!(store.list(), Err(StoreError::ParseError { .. })));
    }
}
