//! Container configuration and observed state

use crate::compose::topology::{HealthcheckSpec, PortMapping};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Container status as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container is paused
    Paused,
    /// Container is restarting
    Restarting,
    /// Container is being removed
    Removing,
    /// Container has exited
    Exited,
    /// Container is in an error state
    Dead,
}

impl ContainerStatus {
    /// Parse the runtime's status word
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(ContainerStatus::Created),
            "running" => Some(ContainerStatus::Running),
            "paused" => Some(ContainerStatus::Paused),
            "restarting" => Some(ContainerStatus::Restarting),
            "removing" => Some(ContainerStatus::Removing),
            "exited" => Some(ContainerStatus::Exited),
            "dead" => Some(ContainerStatus::Dead),
            _ => None,
        }
    }

    /// Whether a stop signal still has something to stop
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ContainerStatus::Running | ContainerStatus::Paused | ContainerStatus::Restarting
        )
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Removing => write!(f, "removing"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Healthcheck status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    /// Parse the runtime's health word
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "starting" => Some(HealthStatus::Starting),
            "healthy" => Some(HealthStatus::Healthy),
            "unhealthy" => Some(HealthStatus::Unhealthy),
            _ => None,
        }
    }
}

/// Snapshot returned by an inspect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: ContainerStatus,
    /// `None` when the container has no healthcheck
    pub health: Option<HealthStatus>,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
}

/// A mount handed to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mount {
    Volume {
        name: String,
        target: String,
        read_only: bool,
    },
    Bind {
        source: PathBuf,
        target: String,
        read_only: bool,
    },
    Anonymous {
        target: String,
    },
}

/// Everything the runtime needs to run one service container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Container name
    pub name: String,
    /// Image name/tag
    pub image: String,
    /// Entrypoint override
    pub entrypoint: Option<Vec<String>>,
    /// Command override
    pub command: Option<Vec<String>>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Published ports
    pub ports: Vec<PortMapping>,
    /// Volume and bind mounts
    pub mounts: Vec<Mount>,
    /// Network to attach to
    pub network: String,
    /// DNS aliases on that network
    pub network_aliases: Vec<String>,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Healthcheck
    pub healthcheck: Option<HealthcheckSpec>,
    /// Working directory
    pub working_dir: Option<String>,
    /// User to run as
    pub user: Option<String>,
    /// Signal delivered on stop
    pub stop_signal: String,
}

impl ContainerConfig {
    /// Create a new container configuration
    pub fn new(name: &str, image: &str, network: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            entrypoint: None,
            command: None,
            env: BTreeMap::new(),
            ports: Vec::new(),
            mounts: Vec::new(),
            network: network.to_string(),
            network_aliases: Vec::new(),
            labels: BTreeMap::new(),
            healthcheck: None,
            working_dir: None,
            user: None,
            stop_signal: "SIGTERM".to_string(),
        }
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Add mount
    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }
}
