//! Compose file configuration types
//!
//! These mirror the on-disk YAML shape. They are loose on purpose: every
//! field is optional and both short and long syntaxes are accepted. The
//! loader turns them into the strict [`crate::compose::topology`] types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version (informational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    /// Volumes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Command override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandConfig>,
    /// Explicit container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Networks to attach to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworksConfig>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Working directory inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// User to run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Signal delivered on stop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    /// Time to wait after the stop signal before killing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<String>,
}

/// Command configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell-style string, split into words
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<Scalar>>),
}

/// A YAML scalar that is used as a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::String(s) => write!(f, "{}", s),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port
    Number(u16),
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<Scalar>,
    /// Host IP to bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "source:target:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    /// Source path or volume name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to config
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

impl NetworksConfig {
    /// Network keys referenced by the service
    pub fn names(&self) -> Vec<String> {
        match self {
            NetworksConfig::Array(arr) => arr.clone(),
            NetworksConfig::Map(map) => map.keys().cloned().collect(),
        }
    }

    /// Extra aliases requested on `network`
    pub fn aliases(&self, network: &str) -> Vec<String> {
        match self {
            NetworksConfig::Array(_) => Vec::new(),
            NetworksConfig::Map(map) => map
                .get(network)
                .and_then(|c| c.as_ref())
                .and_then(|c| c.aliases.clone())
                .unwrap_or_default(),
        }
    }
}

/// Service network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    /// Aliases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(BTreeMap<String, DependsOnCondition>),
}

impl DependsOnConfig {
    /// Pairs of (dependency, condition) with the condition defaulted
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            DependsOnConfig::Array(arr) => arr.iter().map(|d| (d.clone(), None)).collect(),
            DependsOnConfig::Map(map) => map
                .iter()
                .map(|(d, c)| (d.clone(), c.condition.clone()))
                .collect(),
        }
    }
}

/// Depends on condition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<CommandConfig>,
    /// Interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Start period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    /// Disable healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,
}

/// Labels configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of "key=value" strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Scalar>),
}

impl LabelsConfig {
    /// Flatten into a map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            LabelsConfig::Array(arr) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
            LabelsConfig::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// External network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConfig>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// External volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConfig>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// External resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// With name
    Named { name: String },
}

impl ExternalConfig {
    /// Whether the resource is managed outside the project
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Bool(b) => *b,
            ExternalConfig::Named { .. } => true,
        }
    }

    /// Name override carried by the legacy `external: {name: ..}` form
    pub fn name(&self) -> Option<&str> {
        match self {
            ExternalConfig::Bool(_) => None,
            ExternalConfig::Named { name } => Some(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_map_accepts_scalars() {
        let yaml = r#"
PORT: 8000
DEBUG: true
RATIO: 0.5
EMPTY:
NAME: api
"#;
        let env: EnvironmentConfig = serde_yaml::from_str(yaml).unwrap();
        let EnvironmentConfig::Map(map) = env else {
            panic!("expected map form");
        };
        assert_eq!(map["PORT"].as_ref().unwrap().to_string(), "8000");
        assert_eq!(map["DEBUG"].as_ref().unwrap().to_string(), "true");
        assert_eq!(map["RATIO"].as_ref().unwrap().to_string(), "0.5");
        assert!(map["EMPTY"].is_none());
        assert_eq!(map["NAME"].as_ref().unwrap().to_string(), "api");
    }

    #[test]
    fn test_depends_on_both_forms() {
        let arr: DependsOnConfig = serde_yaml::from_str("[broker, db]").unwrap();
        assert_eq!(
            arr.entries(),
            vec![("broker".to_string(), None), ("db".to_string(), None)]
        );

        let map: DependsOnConfig =
            serde_yaml::from_str("broker:\n  condition: service_healthy\n").unwrap();
        assert_eq!(
            map.entries(),
            vec![("broker".to_string(), Some("service_healthy".to_string()))]
        );
    }

    #[test]
    fn test_top_level_volume_without_body() {
        let yaml = r#"
services: {}
volumes:
  cache-data:
networks:
  backend:
    driver: bridge
"#;
        let config: ComposeConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.volumes["cache-data"].is_none());
        assert_eq!(
            config.networks["backend"].as_ref().unwrap().driver.as_deref(),
            Some("bridge")
        );
    }

    #[test]
    fn test_labels_array_form() {
        let labels = LabelsConfig::Array(vec!["tier=cache".into(), "flag".into()]);
        let map = labels.to_map();
        assert_eq!(map["tier"], "cache");
        assert_eq!(map["flag"], "");
    }
}
