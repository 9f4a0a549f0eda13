//! In-process container runtime
//!
//! [`MemoryRuntime`] keeps a container table instead of talking to an
//! engine. Used by `up --dry-run` and by the launcher tests, which inspect
//! its event log.

use super::config::{ContainerConfig, ContainerState, ContainerStatus, HealthStatus, Mount};
use super::runtime::ContainerRuntime;
use crate::compose::topology::{NetworkSpec, VolumeSpec};
use crate::error::{ComposeError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Exit code reported for a killed container
pub const KILLED_EXIT_CODE: i64 = 137;

/// Something the runtime was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    NetworkCreated(String),
    NetworkRemoved(String),
    VolumeCreated(String),
    VolumeRemoved(String),
    /// Container started; `running` lists containers already running then
    Run { name: String, running: Vec<String> },
    Signal { name: String, signal: String },
    Killed(String),
    Removed(String),
}

struct Record {
    config: ContainerConfig,
    state: ContainerState,
    exit: watch::Sender<Option<i64>>,
}

impl Record {
    fn exit_with(&mut self, code: i64) {
        self.state.status = ContainerStatus::Exited;
        self.state.exit_code = Some(code);
        self.exit.send_replace(Some(code));
    }
}

/// Container runtime that never leaves the process
#[derive(Default)]
pub struct MemoryRuntime {
    /// All containers indexed by ID
    containers: Arc<RwLock<HashMap<String, Record>>>,
    networks: RwLock<BTreeSet<String>>,
    volumes: RwLock<BTreeSet<String>>,
    events: RwLock<Vec<RuntimeEvent>>,
    /// Services whose container fails to start
    fail_start: BTreeSet<String>,
    /// Services that ignore the stop signal
    ignore_stop: BTreeSet<String>,
    /// Services whose healthcheck reports unhealthy
    unhealthy: BTreeSet<String>,
    /// Services whose stopped container cannot be removed
    fail_remove: BTreeSet<String>,
    start_delay: Option<Duration>,
}

impl MemoryRuntime {
    /// Create an empty runtime
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service`'s container fail on start
    pub fn fail_start(mut self, service: &str) -> Self {
        self.fail_start.insert(service.to_string());
        self
    }

    /// Make `service`'s container ignore stop signals
    pub fn ignore_stop(mut self, service: &str) -> Self {
        self.ignore_stop.insert(service.to_string());
        self
    }

    /// Make `service`'s healthcheck report unhealthy
    pub fn unhealthy(mut self, service: &str) -> Self {
        self.unhealthy.insert(service.to_string());
        self
    }

    /// Make removal of `service`'s container fail
    pub fn fail_remove(mut self, service: &str) -> Self {
        self.fail_remove.insert(service.to_string());
        self
    }

    /// Delay every container start
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Container names in the order they were started
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RuntimeEvent::Run { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Containers already running when `name` started
    pub fn running_when_started(&self, name: &str) -> Option<Vec<String>> {
        self.events().into_iter().find_map(|e| match e {
            RuntimeEvent::Run { name: n, running } if n == name => Some(running),
            _ => None,
        })
    }

    /// Times `name` was force-killed
    pub fn kill_count(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, RuntimeEvent::Killed(n) if n == name))
            .count()
    }

    /// Configuration `name` was started with
    pub fn container_config(&self, name: &str) -> Option<ContainerConfig> {
        let containers = self.containers.read().ok()?;
        containers
            .values()
            .find(|r| r.config.name == name)
            .map(|r| r.config.clone())
    }

    /// Networks that currently exist
    pub fn networks(&self) -> Vec<String> {
        self.networks
            .read()
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Volumes that currently exist
    pub fn volumes(&self) -> Vec<String> {
        self.volumes
            .read()
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, event: RuntimeEvent) -> Result<()> {
        let mut events = self
            .events
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
        events.push(event);
        Ok(())
    }

    fn service_of(config: &ContainerConfig) -> &str {
        config
            .labels
            .get("com.docker.compose.service")
            .map(|s| s.as_str())
            .unwrap_or(&config.name)
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create_network(&self, network: &NetworkSpec) -> Result<()> {
        {
            let mut networks = self
                .networks
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
            networks.insert(network.name.clone());
        }
        self.record(RuntimeEvent::NetworkCreated(network.name.clone()))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        {
            let mut networks = self
                .networks
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
            if !networks.remove(name) {
                return Err(ComposeError::Network(format!("Network not found: {}", name)));
            }
        }
        self.record(RuntimeEvent::NetworkRemoved(name.to_string()))
    }

    async fn create_volume(&self, volume: &VolumeSpec) -> Result<()> {
        {
            let mut volumes = self
                .volumes
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
            volumes.insert(volume.name.clone());
        }
        self.record(RuntimeEvent::VolumeCreated(volume.name.clone()))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        {
            let containers = self
                .containers
                .read()
                .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;
            let in_use = containers.values().any(|r| {
                r.config
                    .mounts
                    .iter()
                    .any(|m| matches!(m, Mount::Volume { name: n, .. } if n == name))
            });
            if in_use {
                return Err(ComposeError::Volume(format!("Volume {} is in use", name)));
            }

            let mut volumes = self
                .volumes
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
            if !volumes.remove(name) {
                return Err(ComposeError::VolumeNotFound(name.to_string()));
            }
        }
        self.record(RuntimeEvent::VolumeRemoved(name.to_string()))
    }

    async fn run(&self, config: &ContainerConfig) -> Result<String> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }

        let service = Self::service_of(config);
        if self.fail_start.contains(service) {
            return Err(ComposeError::Runtime(format!(
                "container {} exited immediately with code 1",
                config.name
            )));
        }

        let id = Uuid::new_v4().to_string().replace('-', "")[..12].to_string();
        let health = config.healthcheck.as_ref().map(|_| {
            if self.unhealthy.contains(service) {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Healthy
            }
        });

        let running = {
            let mut containers = self
                .containers
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;

            if containers.values().any(|r| r.config.name == config.name) {
                return Err(ComposeError::Runtime(format!(
                    "The container name \"{}\" is already in use",
                    config.name
                )));
            }

            let mut running: Vec<String> = containers
                .values()
                .filter(|r| r.state.status == ContainerStatus::Running)
                .map(|r| r.config.name.clone())
                .collect();
            running.sort();

            let (exit, _) = watch::channel(None);
            containers.insert(
                id.clone(),
                Record {
                    config: config.clone(),
                    state: ContainerState {
                        status: ContainerStatus::Running,
                        health,
                        exit_code: None,
                        started_at: Some(Utc::now()),
                    },
                    exit,
                },
            );
            running
        };

        self.record(RuntimeEvent::Run {
            name: config.name.clone(),
            running,
        })?;
        Ok(id)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let containers = self
            .containers
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;

        containers
            .get(id)
            .map(|r| r.state.clone())
            .ok_or_else(|| ComposeError::ContainerNotFound(id.to_string()))
    }

    async fn signal_stop(&self, id: &str, signal: &str) -> Result<()> {
        let name = {
            let mut containers = self
                .containers
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
            let record = containers
                .get_mut(id)
                .ok_or_else(|| ComposeError::ContainerNotFound(id.to_string()))?;

            if record.state.status.is_active()
                && !self.ignore_stop.contains(Self::service_of(&record.config))
            {
                record.exit_with(0);
            }
            record.config.name.clone()
        };

        self.record(RuntimeEvent::Signal {
            name,
            signal: signal.to_string(),
        })
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut exit = {
            let containers = self
                .containers
                .read()
                .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;
            containers
                .get(id)
                .map(|r| r.exit.subscribe())
                .ok_or_else(|| ComposeError::ContainerNotFound(id.to_string()))?
        };

        let code = exit
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| ComposeError::ContainerNotFound(id.to_string()))?;
        Ok(code.unwrap_or_default())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let name = {
            let mut containers = self
                .containers
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
            let record = containers
                .get_mut(id)
                .ok_or_else(|| ComposeError::ContainerNotFound(id.to_string()))?;

            if record.state.status.is_active() {
                record.exit_with(KILLED_EXIT_CODE);
            }
            record.config.name.clone()
        };

        self.record(RuntimeEvent::Killed(name))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let name = {
            let mut containers = self
                .containers
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
            let record = containers
                .get(id)
                .ok_or_else(|| ComposeError::ContainerNotFound(id.to_string()))?;

            if record.state.status.is_active() {
                return Err(ComposeError::Runtime(format!(
                    "You cannot remove a running container {}",
                    id
                )));
            }
            if self.fail_remove.contains(Self::service_of(&record.config)) {
                return Err(ComposeError::Runtime(format!(
                    "removal of container {} failed: device or resource busy",
                    id
                )));
            }
            let name = record.config.name.clone();
            containers.remove(id);
            name
        };

        self.record(RuntimeEvent::Removed(name))
    }
}
