//! Durable storage for the device registry

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::clock::Stamp;
use super::types::{Device, DeviceField, DeviceId};
use crate::{Error, Result};

/// Per-field stamps of a stored device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldClocks {
    pub name: Stamp,
    pub address: Stamp,
    pub pinned: Stamp,
    pub status: Stamp,
}

impl Default for FieldClocks {
    fn default() -> Self {
        Self {
            name: Stamp::epoch(),
            address: Stamp::epoch(),
            pinned: Stamp::epoch(),
            status: Stamp::epoch(),
        }
    }
}

impl FieldClocks {
    /// Stamp slot for a field; `None` for `Removed`, which lives in tombstones
    pub fn slot_mut(&mut self, field: DeviceField) -> Option<&mut Stamp> {
        match field {
            DeviceField::Name => Some(&mut self.name),
            DeviceField::Address => Some(&mut self.address),
            DeviceField::Pinned => Some(&mut self.pinned),
            DeviceField::Status => Some(&mut self.status),
            DeviceField::Removed => None,
        }
    }

    /// Fields paired with their stamps
    #[must_use]
    pub fn iter(&self) -> [(DeviceField, &Stamp); 4] {
        [
            (DeviceField::Name, &self.name),
            (DeviceField::Address, &self.address),
            (DeviceField::Pinned, &self.pinned),
            (DeviceField::Status, &self.status),
        ]
    }
}

/// A device together with its field clocks and insertion sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device: Device,
    #[serde(default)]
    pub clocks: FieldClocks,
    #[serde(default)]
    pub seq: u64,
}

/// Deleted device id and the stamp of its deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub device_id: DeviceId,
    pub stamp: Stamp,
}

/// Everything the registry persists, devices in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRegistry {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
}

/// Durable storage used by the registry at startup and after each mutation batch
pub trait DeviceStore: Send {
    /// Load the persisted registry; an absent store yields an empty registry
    ///
    /// # Errors
    ///
    /// Returns error if the store exists but cannot be read or decoded
    fn load(&self) -> Result<StoredRegistry>;

    /// Replace the persisted registry
    ///
    /// # Errors
    ///
    /// Returns error if the registry cannot be written
    fn save(&self, state: &StoredRegistry) -> Result<()>;
}

/// JSON file store with atomic replace
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceStore for JsonFileStore {
    fn load(&self) -> Result<StoredRegistry> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no device store yet, starting empty");
            return Ok(StoredRegistry::default());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let state: StoredRegistry = serde_json::from_str(&content).map_err(|e| {
            Error::Storage(format!("failed to decode {}: {e}", self.path.display()))
        })?;

        tracing::info!(
            path = %self.path.display(),
            devices = state.devices.len(),
            "loaded device store"
        );
        Ok(state)
    }

    fn save(&self, state: &StoredRegistry) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, state)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Storage(format!("failed to replace {}: {e}", self.path.display())))?;

        tracing::debug!(path = %self.path.display(), devices = state.devices.len(), "saved device store");
        Ok(())
    }
}

/// In-memory store; clones share the same contents
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoredRegistry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a registry
    #[must_use]
    pub fn with_state(state: StoredRegistry) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Copy of the last saved contents
    #[must_use]
    pub fn contents(&self) -> StoredRegistry {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DeviceStore for MemoryStore {
    fn load(&self) -> Result<StoredRegistry> {
        Ok(self.contents())
    }

    fn save(&self, state: &StoredRegistry) -> Result<()> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceStatus, WakeAddress};

    fn sample_state() -> StoredRegistry {
        StoredRegistry {
            devices: vec![DeviceRecord {
                device: Device {
                    id: DeviceId::from("desk"),
                    name: "Desktop".to_string(),
                    address: WakeAddress::new("aa:bb:cc:dd:ee:ff", "192.168.1.255", 9).unwrap(),
                    is_pinned: true,
                    status: DeviceStatus::Offline,
                },
                clocks: FieldClocks::default(),
                seq: 0,
            }],
            tombstones: vec![Tombstone {
                device_id: DeviceId::from("old"),
                stamp: Stamp::new(3, "phone"),
            }],
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("devices.json"));
        assert_eq!(store.load().unwrap(), StoredRegistry::default());
    }

    #[test]
    fn file_store_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("devices.json"));

        store.save(&sample_state()).unwrap();
        assert_eq!(store.load().unwrap(), sample_state());
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = JsonFileStore::new(path).load().unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn memory_store_clones_share_contents() {
        let store = MemoryStore::new();
        let view = store.clone();
        store.save(&sample_state()).unwrap();
        assert_eq!(view.contents().devices.len(), 1);
    }
}
