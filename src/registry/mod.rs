//! # Device Registry
//!
//! In-memory table of [`DeviceRecord`]s keyed by device name with an optional
//! backing file. The registry never writes on its own; callers decide when a
//! snapshot is flushed with [`DeviceRegistry::store`].
//!
//! ## File format
//! Snapshots are pretty printed TOML, one `[[device]]` table per record:
//!
//! ```toml
//! [[device]]
//! name = "device1"
//! time = 1700000000000
//! size = 1024
//!
//! [device.ext]
//! vendor = "acme"
//! ```
//!
//! TOML integers are signed, so a `time` or `size` above `i64::MAX` is written
//! as a decimal string (`size = "18446744073709551615"`).

use crate::proto::DeviceRecord;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Deserialize, Serialize, Default, Debug)]
struct Snapshot {
    #[serde(default, rename = "device")]
    devices: Vec<StoredDevice>,
}

/// On-disk form of a [`DeviceRecord`]
#[derive(Deserialize, Serialize, Debug)]
struct StoredDevice {
    name: String,
    time: StoredU64,
    size: StoredU64,
    #[serde(default)]
    ext: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(untagged)]
enum StoredU64 {
    Int(i64),
    Text(String),
}

impl From<u64> for StoredU64 {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(value) => StoredU64::Int(value),
            Err(_) => StoredU64::Text(value.to_string()),
        }
    }
}

impl StoredU64 {
    fn value(&self) -> Result<u64> {
        match self {
            StoredU64::Int(value) => {
                u64::try_from(*value).map_err(|_| eyre!("Negative value {}", value))
            }
            StoredU64::Text(text) => text
                .parse()
                .map_err(|e| eyre!("Invalid value '{}': {}", text, e)),
        }
    }
}

impl From<&DeviceRecord> for StoredDevice {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            name: record.name.clone(),
            time: record.time.into(),
            size: record.size.into(),
            ext: record.ext.clone(),
        }
    }
}

impl TryFrom<StoredDevice> for DeviceRecord {
    type Error = color_eyre::Report;

    fn try_from(stored: StoredDevice) -> Result<Self> {
        let time = stored
            .time
            .value()
            .map_err(|e| eyre!("Device {} has a bad time: {}", stored.name, e))?;
        let size = stored
            .size
            .value()
            .map_err(|e| eyre!("Device {} has a bad size: {}", stored.name, e))?;
        Ok(DeviceRecord {
            name: stored.name,
            time,
            size,
            ext: stored.ext,
        })
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceRecord>,
    file: Option<PathBuf>,
}

impl DeviceRegistry {
    /// Empty registry without persistence
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry bound to `path`, filled from it when the file exists.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut registry = Self {
            devices: BTreeMap::new(),
            file: Some(path.to_path_buf()),
        };

        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if registry file exists: {}", e))?
        {
            debug!(
                "Registry file {} does not exist, starting empty",
                path.display()
            );
            return Ok(registry);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read registry file {}: {}", path.display(), e))?;
        let snapshot: Snapshot = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse registry file {}: {}", path.display(), e))?;

        for stored in snapshot.devices {
            let record = DeviceRecord::try_from(stored)
                .map_err(|e| eyre!("Failed to read registry file {}: {}", path.display(), e))?;
            registry.devices.insert(record.name.clone(), record);
        }

        info!(
            "Loaded {} devices from {}",
            registry.devices.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn set_file(&mut self, path: impl Into<PathBuf>) {
        self.file = Some(path.into());
    }

    /// Writes the whole table to the backing file. No-op without one.
    pub async fn store(&self) -> Result<()> {
        let Some(path) = &self.file else {
            debug!("Registry has no backing file, skipping store");
            return Ok(());
        };
        self.store_to(path).await
    }

    /// Writes the whole table to `path` without binding the registry to it.
    pub async fn store_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create registry directory: {}", e))?;
        }

        let snapshot = Snapshot {
            devices: self.devices.values().map(StoredDevice::from).collect(),
        };
        let content = toml::to_string_pretty(&snapshot)
            .map_err(|e| eyre!("Failed to serialize devices: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write registry file {}: {}", path.display(), e))?;

        debug!("Stored {} devices in {}", self.devices.len(), path.display());
        Ok(())
    }

    /// Inserts or replaces the record with the same name.
    pub fn insert(&mut self, record: DeviceRecord) -> Option<DeviceRecord> {
        self.devices.insert(record.name.clone(), record)
    }

    pub fn delete(&mut self, name: &str) -> Option<DeviceRecord> {
        self.devices.remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.get(name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Records in registry order (by name)
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }
}
