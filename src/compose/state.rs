//! Persisted project state
//!
//! `up -d` and a later `down` usually run in different processes, so the
//! launcher writes what it started to `<state_dir>/<project>.json`.

use crate::error::{ComposeError, Result};
use crate::network::Network;
use crate::storage::Volume;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where a service is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Waiting for dependencies
    Pending,
    /// Container started, waiting for readiness
    Starting,
    /// Ready
    Running,
    /// Container failed to start or become ready
    Failed,
    /// Not started because a dependency failed
    Skipped,
    /// Stop signal delivered
    Stopping,
    /// Exited after the stop signal
    Stopped,
    /// Force-killed after the grace period
    Killed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Failed => write!(f, "failed"),
            ServiceState::Skipped => write!(f, "skipped"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Killed => write!(f, "killed"),
        }
    }
}

/// What the launcher knows about one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service name
    pub service: String,
    /// Runtime container ID, once started
    pub container_id: Option<String>,
    /// Container name
    pub container_name: String,
    /// Lifecycle state
    pub state: ServiceState,
    /// When the container was started
    pub started_at: Option<DateTime<Utc>>,
    /// Named volumes this service holds a reference on
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Network this service holds a reference on
    #[serde(default)]
    pub network: Option<String>,
    /// Mount targets left out because their source did not resolve
    #[serde(default)]
    pub skipped_mounts: Vec<String>,
}

impl ServiceRecord {
    /// Fresh record for a service that has not started
    pub fn pending(service: &str, container_name: &str) -> Self {
        Self {
            service: service.to_string(),
            container_id: None,
            container_name: container_name.to_string(),
            state: ServiceState::Pending,
            started_at: None,
            volumes: Vec::new(),
            network: None,
            skipped_mounts: Vec::new(),
        }
    }

    /// Whether this service still holds runtime resources
    pub fn holds_resources(&self) -> bool {
        self.network.is_some() || !self.volumes.is_empty()
    }
}

/// Snapshot of a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    pub project: String,
    pub services: BTreeMap<String, ServiceRecord>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub networks: Vec<Network>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    /// Empty state for `project`
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            services: BTreeMap::new(),
            volumes: Vec::new(),
            networks: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// JSON files under a state directory, one per project
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{}.json", project))
    }

    /// Load the state of `project`, if any was saved
    pub fn load(&self, project: &str) -> Result<Option<ProjectState>> {
        let path = self.path(project);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let state: ProjectState = serde_json::from_str(&content).map_err(|e| {
            ComposeError::State(format!("Corrupt state file {}: {}", path.display(), e))
        })?;

        if state.project != project {
            return Err(ComposeError::State(format!(
                "State file {} belongs to project '{}'",
                path.display(),
                state.project
            )));
        }
        Ok(Some(state))
    }

    /// Write the state atomically
    pub fn save(&self, state: &ProjectState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path(&state.project);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Forget the project
    pub fn clear(&self, project: &str) -> Result<()> {
        let path = self.path(project);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
