//! Network tracking

use crate::compose::topology::NetworkSpec;
use crate::error::{ComposeError, Result};
use crate::storage::Acquisition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Network driver types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// Bridge network (default)
    #[default]
    Bridge,
    /// Host network
    Host,
    /// Overlay network
    Overlay,
    /// Anything else the runtime understands
    Other(String),
}

impl NetworkDriver {
    /// Parse a driver name
    pub fn parse(name: &str) -> Self {
        match name {
            "bridge" => NetworkDriver::Bridge,
            "host" => NetworkDriver::Host,
            "overlay" => NetworkDriver::Overlay,
            other => NetworkDriver::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkDriver::Bridge => write!(f, "bridge"),
            NetworkDriver::Host => write!(f, "host"),
            NetworkDriver::Overlay => write!(f, "overlay"),
            NetworkDriver::Other(name) => write!(f, "{}", name),
        }
    }
}

/// What the caller should do after a release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Last reference gone: remove it from the runtime
    Remove,
    /// Still referenced, or external
    Retain,
}

/// A tracked network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name
    pub name: String,
    /// Network driver
    pub driver: NetworkDriver,
    /// Managed outside this project
    pub external: bool,
    /// Attached services
    pub ref_count: u32,
    /// Created timestamp
    pub created: DateTime<Utc>,
}

impl Network {
    /// Track a new network from its spec
    pub fn new(spec: &NetworkSpec) -> Self {
        Self {
            name: spec.name.clone(),
            driver: NetworkDriver::parse(&spec.driver),
            external: spec.external,
            ref_count: 0,
            created: Utc::now(),
        }
    }
}

/// Reference counts for the networks services attach to
#[derive(Debug, Default)]
pub struct NetworkManager {
    networks: Arc<RwLock<BTreeMap<String, Network>>>,
}

impl NetworkManager {
    /// Create an empty network manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a persisted snapshot
    pub fn from_snapshot(networks: Vec<Network>) -> Self {
        Self {
            networks: Arc::new(RwLock::new(
                networks.into_iter().map(|n| (n.name.clone(), n)).collect(),
            )),
        }
    }

    /// Attach one more service to the network
    pub fn acquire(&self, spec: &NetworkSpec) -> Result<Acquisition> {
        let mut networks = self
            .networks
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        let outcome = if networks.contains_key(&spec.name) || spec.external {
            Acquisition::Existing
        } else {
            Acquisition::Create
        };

        let network = networks
            .entry(spec.name.clone())
            .or_insert_with(|| Network::new(spec));
        network.ref_count += 1;

        Ok(outcome)
    }

    /// Undo an acquire whose runtime creation failed
    pub fn forget(&self, name: &str) -> Result<()> {
        let mut networks = self
            .networks
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        networks.remove(name);
        Ok(())
    }

    /// Detach a service; the network stops being tracked at zero
    pub fn release(&self, name: &str) -> Result<Release> {
        let mut networks = self
            .networks
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

        let network = networks
            .get_mut(name)
            .ok_or_else(|| ComposeError::Network(format!("Network not found: {}", name)))?;

        network.ref_count = network.ref_count.saturating_sub(1);
        if network.ref_count > 0 {
            return Ok(Release::Retain);
        }

        let external = network.external;
        networks.remove(name);
        Ok(if external {
            Release::Retain
        } else {
            Release::Remove
        })
    }

    /// Get a network by name
    pub fn get(&self, name: &str) -> Result<Network> {
        let networks = self
            .networks
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;

        networks
            .get(name)
            .cloned()
            .ok_or_else(|| ComposeError::Network(format!("Network not found: {}", name)))
    }

    /// List all networks
    pub fn list(&self) -> Result<Vec<Network>> {
        let networks = self
            .networks
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(networks.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(external: bool) -> NetworkSpec {
        NetworkSpec {
            key: "default".to_string(),
            name: "demo_default".to_string(),
            driver: "bridge".to_string(),
            external,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_network_removed_after_last_release() {
        let manager = NetworkManager::new();
        assert_eq!(manager.acquire(&spec(false)).unwrap(), Acquisition::Create);
        assert_eq!(manager.acquire(&spec(false)).unwrap(), Acquisition::Existing);

        assert_eq!(manager.release("demo_default").unwrap(), Release::Retain);
        assert_eq!(manager.release("demo_default").unwrap(), Release::Remove);
        assert!(manager.get("demo_default").is_err());
    }

    #[test]
    fn test_external_network_is_retained() {
        let manager = NetworkManager::new();
        assert_eq!(manager.acquire(&spec(true)).unwrap(), Acquisition::Existing);
        assert_eq!(manager.release("demo_default").unwrap(), Release::Retain);
    }

    #[test]
    fn test_driver_parse() {
        assert_eq!(NetworkDriver::parse("bridge"), NetworkDriver::Bridge);
        assert_eq!(NetworkDriver::parse("macvlan").to_string(), "macvlan");
        assert_eq!(Network::new(&spec(false)).driver, NetworkDriver::Bridge);
    }
}
