//! Volume management
//!
//! Named volumes are reference counted per service that mounts them. A
//! volume is created the first time it is acquired and then outlives its
//! users: dropping the last reference never destroys data, only an explicit
//! [`VolumeManager::remove`] does, and only for an unreferenced volume.

use crate::compose::topology::VolumeSpec;
use crate::error::{ComposeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Outcome of acquiring a shared resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// First use: the caller must create it in the runtime
    Create,
    /// Already present (or external)
    Existing,
}

/// A tracked volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name in the runtime
    pub name: String,
    /// Volume driver
    pub driver: String,
    /// Managed outside this project
    pub external: bool,
    /// Volume labels
    pub labels: BTreeMap<String, String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Number of services currently mounting it
    pub ref_count: u32,
}

impl Volume {
    /// Track a new volume from its spec
    pub fn new(spec: &VolumeSpec) -> Self {
        Self {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            external: spec.external,
            labels: spec.labels.clone(),
            created_at: Utc::now(),
            ref_count: 0,
        }
    }

    /// Whether any service still mounts it
    pub fn in_use(&self) -> bool {
        self.ref_count > 0
    }
}

/// Volume manager
#[derive(Debug, Default)]
pub struct VolumeManager {
    /// Volumes indexed by name
    volumes: Arc<RwLock<BTreeMap<String, Volume>>>,
}

impl VolumeManager {
    /// Create an empty volume manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a persisted snapshot
    pub fn from_snapshot(volumes: Vec<Volume>) -> Self {
        Self {
            volumes: Arc::new(RwLock::new(
                volumes.into_iter().map(|v| (v.name.clone(), v)).collect(),
            )),
        }
    }

    /// Take a reference on the volume described by `spec`
    pub fn acquire(&self, spec: &VolumeSpec) -> Result<Acquisition> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        let outcome = if volumes.contains_key(&spec.name) || spec.external {
            Acquisition::Existing
        } else {
            Acquisition::Create
        };

        let volume = volumes
            .entry(spec.name.clone())
            .or_insert_with(|| Volume::new(spec));
        volume.ref_count += 1;

        tracing::debug!("Volume {} now has {} reference(s)", spec.name, volume.ref_count);
        Ok(outcome)
    }

    /// Undo an acquire whose runtime creation failed
    pub fn forget(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        volumes.remove(name);
        Ok(())
    }

    /// Drop a reference; the volume itself is kept
    pub fn release(&self, name: &str) -> Result<u32> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| ComposeError::VolumeNotFound(name.to_string()))?;

        volume.ref_count = volume.ref_count.saturating_sub(1);
        Ok(volume.ref_count)
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<Volume> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;

        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| ComposeError::VolumeNotFound(name.to_string()))
    }

    /// List all volumes
    pub fn list(&self) -> Result<Vec<Volume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(volumes.values().cloned().collect())
    }

    /// Stop tracking a volume so the caller can destroy it
    pub fn remove(&self, name: &str) -> Result<Volume> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get(name)
            .ok_or_else(|| ComposeError::VolumeNotFound(name.to_string()))?;

        if volume.in_use() {
            return Err(ComposeError::Volume(format!(
                "Volume {} is in use by {} service(s)",
                name, volume.ref_count
            )));
        }
        if volume.external {
            return Err(ComposeError::Volume(format!(
                "Volume {} is external and is not removed by this project",
                name
            )));
        }

        volumes
            .remove(name)
            .ok_or_else(|| ComposeError::VolumeNotFound(name.to_string()))
    }

    /// Names of project-owned volumes nobody references
    pub fn unreferenced(&self) -> Result<Vec<String>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(volumes
            .values()
            .filter(|v| !v.in_use() && !v.external)
            .map(|v| v.name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> VolumeSpec {
        VolumeSpec {
            key: name.to_string(),
            name: format!("demo_{}", name),
            driver: "local".to_string(),
            external: false,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_first_acquire_creates() {
        let manager = VolumeManager::new();
        assert_eq!(manager.acquire(&spec("data")).unwrap(), Acquisition::Create);
        assert_eq!(manager.acquire(&spec("data")).unwrap(), Acquisition::Existing);
        assert_eq!(manager.get("demo_data").unwrap().ref_count, 2);
    }

    #[test]
    fn test_release_keeps_volume() {
        let manager = VolumeManager::new();
        manager.acquire(&spec("data")).unwrap();
        assert_eq!(manager.release("demo_data").unwrap(), 0);

        // Still tracked, so a restart does not recreate it
        assert_eq!(manager.acquire(&spec("data")).unwrap(), Acquisition::Existing);
    }

    #[test]
    fn test_remove_requires_no_references() {
        let manager = VolumeManager::new();
        manager.acquire(&spec("data")).unwrap();
        assert!(manager.remove("demo_data").is_err());

        manager.release("demo_data").unwrap();
        assert_eq!(manager.unreferenced().unwrap(), vec!["demo_data"]);
        manager.remove("demo_data").unwrap();
        assert!(manager.get("demo_data").is_err());
    }

    #[test]
    fn test_external_volume_is_never_created_or_removed() {
        let manager = VolumeManager::new();
        let mut external = spec("shared");
        external.external = true;

        assert_eq!(manager.acquire(&external).unwrap(), Acquisition::Existing);
        manager.release("demo_shared").unwrap();
        assert!(manager.unreferenced().unwrap().is_empty());
        assert!(manager.remove("demo_shared").is_err());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let manager = VolumeManager::new();
        manager.acquire(&spec("data")).unwrap();
        let restored = VolumeManager::from_snapshot(manager.list().unwrap());
        assert_eq!(restored.get("demo_data").unwrap().ref_count, 1);
    }
}
