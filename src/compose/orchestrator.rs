//! Project launcher
//!
//! Starts every service of a [`Topology`] once its dependencies are ready
//! and stops them again in reverse dependency order.
//!
//! Each service gets its own task on `up`. A task waits on the readiness
//! channels of its dependencies, provisions the shared network and its
//! volumes, runs the container and publishes its own readiness. A failed
//! service publishes `Failed`, which makes every dependent skip in turn
//! while unrelated services carry on.

use super::interpolate::Environment;
use super::state::{ProjectState, ServiceRecord, ServiceState, StateStore};
use super::topology::{Dependency, DependencyCondition, MountSource, ServiceSpec, Topology};
use crate::config::LauncherConfig;
use crate::container::{
    ContainerConfig, ContainerRuntime, ContainerStatus, HealthStatus, Mount,
};
use crate::error::{ComposeError, Result};
use crate::network::{NetworkManager, Release};
use crate::storage::{Acquisition, VolumeManager};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

/// Label carrying the project name
pub const PROJECT_LABEL: &str = "com.docker.compose.project";

/// Label carrying the service name
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Readiness published by a service task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Started,
    Healthy,
    Unhealthy,
    Failed,
}

impl Readiness {
    /// `Some(true)` once `condition` holds, `Some(false)` once it never will
    fn satisfies(self, condition: DependencyCondition) -> Option<bool> {
        match (self, condition) {
            (Readiness::Pending, _) => None,
            (Readiness::Failed, _) => Some(false),
            (_, DependencyCondition::ServiceStarted) => Some(true),
            (Readiness::Started, DependencyCondition::ServiceHealthy) => None,
            (Readiness::Healthy, DependencyCondition::ServiceHealthy) => Some(true),
            (Readiness::Unhealthy, DependencyCondition::ServiceHealthy) => Some(false),
        }
    }
}

/// Result of starting one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "outcome", content = "detail")]
pub enum ServiceOutcome {
    Running,
    Failed(String),
    /// Not started; names the dependency that blocked it
    Skipped(String),
}

impl std::fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceOutcome::Running => write!(f, "running"),
            ServiceOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            ServiceOutcome::Skipped(dep) => write!(f, "skipped: dependency {} not ready", dep),
        }
    }
}

/// Outcome of `up`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpReport {
    pub services: BTreeMap<String, ServiceOutcome>,
}

impl UpReport {
    /// Whether every service is running
    pub fn is_success(&self) -> bool {
        self.services.values().all(|o| *o == ServiceOutcome::Running)
    }
}

/// Result of stopping one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "outcome", content = "detail")]
pub enum StopOutcome {
    /// Exited on its own within the grace period
    Exited(i64),
    /// Force-killed after the grace period
    Killed,
    /// There was nothing to stop
    NotRunning,
    Failed(String),
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopOutcome::Exited(code) => write!(f, "exited ({})", code),
            StopOutcome::Killed => write!(f, "killed"),
            StopOutcome::NotRunning => write!(f, "not running"),
            StopOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Outcome of `down`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownReport {
    pub services: BTreeMap<String, StopOutcome>,
    pub networks_removed: Vec<String>,
    pub volumes_removed: Vec<String>,
}

/// A service as seen by `ps`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub container_name: String,
    pub container_id: Option<String>,
    /// What the launcher recorded
    pub state: ServiceState,
    /// What the runtime reports now
    pub runtime_status: Option<ContainerStatus>,
    pub health: Option<HealthStatus>,
    pub started_at: Option<DateTime<Utc>>,
}

struct Inner {
    topology: Topology,
    runtime: Arc<dyn ContainerRuntime>,
    environment: Environment,
    ready_timeout: Duration,
    poll_interval: Duration,
    records: RwLock<BTreeMap<String, ServiceRecord>>,
    volumes: VolumeManager,
    networks: NetworkManager,
    /// Serialises acquire/create and release/remove of shared resources
    provision: Mutex<()>,
    store: Option<StateStore>,
}

/// Brings a project up and down through a [`ContainerRuntime`]
pub struct Launcher {
    inner: Arc<Inner>,
}

impl Launcher {
    /// Create a launcher, restoring saved state for the project if any
    pub fn new(
        topology: Topology,
        runtime: Arc<dyn ContainerRuntime>,
        environment: Environment,
        config: &LauncherConfig,
    ) -> Result<Self> {
        let store = config.state_dir.as_ref().map(StateStore::new);
        let saved = match &store {
            Some(store) => store.load(&topology.project)?,
            None => None,
        };

        let (mut records, volumes, networks) = match saved {
            Some(state) => {
                tracing::debug!("Restored state for project {}", state.project);
                (
                    state.services,
                    VolumeManager::from_snapshot(state.volumes),
                    NetworkManager::from_snapshot(state.networks),
                )
            }
            None => (BTreeMap::new(), VolumeManager::new(), NetworkManager::new()),
        };

        for (name, spec) in &topology.services {
            records
                .entry(name.clone())
                .or_insert_with(|| ServiceRecord::pending(name, &container_name(&topology, spec)));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                topology,
                runtime,
                environment,
                ready_timeout: config.ready_timeout,
                poll_interval: config.poll_interval,
                records: RwLock::new(records),
                volumes,
                networks,
                provision: Mutex::new(()),
                store,
            }),
        })
    }

    /// Topology being launched
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Start every service, dependencies first
    pub async fn up(&self) -> Result<UpReport> {
        let topology = &self.inner.topology;
        tracing::info!("Starting project {}", topology.project);

        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for name in topology.services.keys() {
            let (tx, rx) = watch::channel(Readiness::Pending);
            senders.insert(name.clone(), tx);
            receivers.insert(name.clone(), rx);
        }

        let mut tasks = JoinSet::new();
        for (name, spec) in &topology.services {
            let Some(ready) = senders.remove(name) else {
                continue;
            };
            let deps: Vec<(Dependency, watch::Receiver<Readiness>)> = spec
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(&dep.service).map(|rx| (dep.clone(), rx.clone())))
                .collect();

            let inner = self.inner.clone();
            let name = name.clone();
            tasks.spawn(async move {
                let outcome = inner.launch(&name, ready, deps).await;
                (name, outcome)
            });
        }

        let mut report = UpReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) = joined
                .map_err(|e| ComposeError::Runtime(format!("Service task failed: {}", e)))?;
            report.services.insert(name, outcome);
        }

        self.inner.persist()?;

        if report.is_success() {
            tracing::info!("Project {} is up", topology.project);
        } else {
            tracing::warn!("Project {} started with failures", topology.project);
        }
        Ok(report)
    }

    /// Stop every service, dependents first, then release shared resources
    pub async fn down(&self, remove_volumes: bool) -> Result<DownReport> {
        let topology = &self.inner.topology;
        tracing::info!("Stopping project {}", topology.project);

        let mut report = DownReport::default();
        for level in topology.levels()?.into_iter().rev() {
            let mut tasks = JoinSet::new();
            for name in level {
                let inner = self.inner.clone();
                tasks.spawn(async move {
                    let outcome = inner.stop_service(&name).await;
                    // A container that could not be stopped or removed keeps its claims
                    let removed = if let StopOutcome::Failed(reason) = &outcome {
                        tracing::warn!("Keeping resources of {} after failed stop: {}", name, reason);
                        None
                    } else {
                        match inner.release_resources(&name).await {
                            Ok(removed) => removed,
                            Err(e) => {
                                tracing::warn!("Failed to release resources of {}: {}", name, e);
                                None
                            }
                        }
                    };
                    (name, outcome, removed)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (name, outcome, removed) = joined
                    .map_err(|e| ComposeError::Runtime(format!("Service task failed: {}", e)))?;
                report.networks_removed.extend(removed);
                report.services.insert(name, outcome);
            }
        }

        if remove_volumes {
            report.volumes_removed = self.inner.remove_unreferenced_volumes().await?;
        }

        self.inner.persist()?;
        tracing::info!("Project {} is down", topology.project);
        Ok(report)
    }

    /// Recorded and live state of each service, in start order
    pub async fn status(&self) -> Result<Vec<ServiceStatus>> {
        let inner = &self.inner;
        let mut statuses = Vec::new();

        for name in inner.topology.start_order()? {
            let Some(record) = inner.record(&name)? else {
                continue;
            };
            let live = match &record.container_id {
                Some(id) => match inner.runtime.inspect(id).await {
                    Ok(state) => Some(state),
                    Err(e) => {
                        tracing::debug!("Cannot inspect {}: {}", record.container_name, e);
                        None
                    }
                },
                None => None,
            };

            statuses.push(ServiceStatus {
                service: name,
                container_name: record.container_name,
                container_id: record.container_id,
                state: record.state,
                runtime_status: live.as_ref().map(|s| s.status),
                health: live.as_ref().and_then(|s| s.health),
                started_at: live.and_then(|s| s.started_at).or(record.started_at),
            });
        }

        Ok(statuses)
    }

    /// Launcher's record of `service`
    pub fn record(&self, service: &str) -> Result<Option<ServiceRecord>> {
        self.inner.record(service)
    }
}

/// `container_name` or `<project>-<service>-1`
fn container_name(topology: &Topology, spec: &ServiceSpec) -> String {
    spec.container_name
        .clone()
        .unwrap_or_else(|| format!("{}-{}-1", topology.project, spec.name))
}

impl Inner {
    fn record(&self, service: &str) -> Result<Option<ServiceRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(records.get(service).cloned())
    }

    fn update_record<F>(&self, service: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceRecord),
    {
        let mut records = self
            .records
            .write()
            .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
        let record = records
            .get_mut(service)
            .ok_or_else(|| ComposeError::ServiceNotFound(service.to_string()))?;
        update(record);
        Ok(())
    }

    fn set_state(&self, service: &str, state: ServiceState) {
        if let Err(e) = self.update_record(service, |r| r.state = state) {
            tracing::warn!("Failed to record state of {}: {}", service, e);
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let services = {
            let records = self
                .records
                .read()
                .map_err(|_| ComposeError::Lock("Failed to acquire read lock".to_string()))?;
            records.clone()
        };
        let volumes = self.volumes.list()?;
        let networks = self.networks.list()?;

        let idle = services.values().all(|r| r.container_id.is_none() && !r.holds_resources());
        if idle && volumes.is_empty() && networks.is_empty() {
            return store.clear(&self.topology.project);
        }

        store.save(&ProjectState {
            project: self.topology.project.clone(),
            services,
            volumes,
            networks,
            updated_at: Utc::now(),
        })
    }

    /// One service task: wait for dependencies, then start
    async fn launch(
        &self,
        name: &str,
        ready: watch::Sender<Readiness>,
        deps: Vec<(Dependency, watch::Receiver<Readiness>)>,
    ) -> ServiceOutcome {
        for (dep, mut rx) in deps {
            let satisfied = rx
                .wait_for(|r| r.satisfies(dep.condition).is_some())
                .await
                .map(|r| r.satisfies(dep.condition) == Some(true))
                .unwrap_or(false);

            if !satisfied {
                tracing::warn!("Not starting {}: dependency {} is not ready", name, dep.service);
                self.set_state(name, ServiceState::Skipped);
                ready.send_replace(Readiness::Failed);
                return ServiceOutcome::Skipped(dep.service);
            }
        }

        match self.start_service(name, &ready).await {
            Ok(()) => ServiceOutcome::Running,
            Err(e) => {
                tracing::error!("{}", e);
                self.set_state(name, ServiceState::Failed);
                ready.send_if_modified(|r| {
                    if *r == Readiness::Pending {
                        *r = Readiness::Failed;
                        true
                    } else {
                        false
                    }
                });
                ServiceOutcome::Failed(match e {
                    ComposeError::StartFailure { reason, .. } => reason,
                    other => other.to_string(),
                })
            }
        }
    }

    async fn start_service(&self, name: &str, ready: &watch::Sender<Readiness>) -> Result<()> {
        let spec = self.topology.service(name)?;
        let needs_health = self.topology.services.values().any(|s| {
            s.depends_on
                .iter()
                .any(|d| d.service == name && d.condition == DependencyCondition::ServiceHealthy)
        });

        if let Some(id) = self.reusable_container(name).await? {
            tracing::info!("Service {} is already running", name);
            return self.await_ready(spec, &id, needs_health, ready).await;
        }

        let mut config = self.container_config(spec)?;
        let mut skipped = Vec::new();
        config.mounts = self.plan_mounts(spec, &mut skipped);
        self.update_record(name, |r| {
            r.container_name = config.name.clone();
            r.skipped_mounts = skipped;
            r.state = ServiceState::Starting;
        })?;

        if let Err(e) = self.provision(spec).await {
            self.release_resources(name).await?;
            return Err(ComposeError::start_failure(name, e.to_string()));
        }

        tracing::info!("Starting service {} as {}", name, config.name);
        let id = match self.runtime.run(&config).await {
            Ok(id) => id,
            Err(e) => {
                self.release_resources(name).await?;
                return Err(ComposeError::start_failure(name, e.to_string()));
            }
        };
        self.update_record(name, |r| {
            r.container_id = Some(id.clone());
            r.started_at = Some(Utc::now());
        })?;

        self.await_ready(spec, &id, needs_health, ready).await
    }

    /// ID of a still-running container from an earlier `up`; a dead one is
    /// cleaned up instead
    async fn reusable_container(&self, name: &str) -> Result<Option<String>> {
        let Some(id) = self.record(name)?.and_then(|r| r.container_id) else {
            return Ok(None);
        };

        match self.runtime.inspect(&id).await {
            Ok(state) if state.status == ContainerStatus::Running => return Ok(Some(id)),
            Ok(_) => {
                if let Err(e) = self.runtime.remove(&id).await {
                    tracing::warn!("Failed to remove stale container {}: {}", id, e);
                }
            }
            Err(ComposeError::ContainerNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.update_record(name, |r| r.container_id = None)?;
        self.release_resources(name).await?;
        Ok(None)
    }

    async fn await_ready(
        &self,
        spec: &ServiceSpec,
        id: &str,
        needs_health: bool,
        ready: &watch::Sender<Readiness>,
    ) -> Result<()> {
        self.wait_running(&spec.name, id).await?;
        self.set_state(&spec.name, ServiceState::Running);
        ready.send_replace(Readiness::Started);

        if needs_health && spec.healthcheck.is_some() {
            match self.wait_healthy(&spec.name, id).await {
                Ok(()) => {
                    ready.send_replace(Readiness::Healthy);
                }
                Err(e) => {
                    ready.send_replace(Readiness::Unhealthy);
                    return Err(e);
                }
            }
        }

        tracing::info!("Service {} is ready", spec.name);
        Ok(())
    }

    async fn wait_running(&self, name: &str, id: &str) -> Result<()> {
        tokio::time::timeout(self.ready_timeout, self.poll_running(name, id))
            .await
            .map_err(|_| {
                ComposeError::start_failure(
                    name,
                    format!("not running after {:?}", self.ready_timeout),
                )
            })?
    }

    async fn poll_running(&self, name: &str, id: &str) -> Result<()> {
        loop {
            let state = self.runtime.inspect(id).await?;
            match state.status {
                ContainerStatus::Running => return Ok(()),
                ContainerStatus::Exited | ContainerStatus::Dead => {
                    return Err(ComposeError::start_failure(
                        name,
                        format!("container exited with code {}", state.exit_code.unwrap_or(-1)),
                    ))
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn wait_healthy(&self, name: &str, id: &str) -> Result<()> {
        tokio::time::timeout(self.ready_timeout, self.poll_healthy(name, id))
            .await
            .map_err(|_| {
                ComposeError::start_failure(
                    name,
                    format!("not healthy after {:?}", self.ready_timeout),
                )
            })?
    }

    async fn poll_healthy(&self, name: &str, id: &str) -> Result<()> {
        loop {
            let state = self.runtime.inspect(id).await?;
            if !state.status.is_active() {
                return Err(ComposeError::start_failure(name, "container exited before healthy"));
            }
            match state.health {
                Some(HealthStatus::Healthy) => return Ok(()),
                Some(HealthStatus::Unhealthy) => {
                    return Err(ComposeError::start_failure(name, "container is unhealthy"))
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    fn container_config(&self, spec: &ServiceSpec) -> Result<ContainerConfig> {
        let mut config = ContainerConfig::new(
            &container_name(&self.topology, spec),
            &spec.image,
            &self.topology.network.name,
        );
        config.labels = spec.labels.clone();
        config = config
            .label(PROJECT_LABEL, &self.topology.project)
            .label(SERVICE_LABEL, &spec.name);

        config.env = spec
            .resolve_environment(&self.environment)
            .map_err(|e| ComposeError::start_failure(&spec.name, e.to_string()))?;
        config.ports = spec.ports.clone();
        config.entrypoint = spec.entrypoint.clone();
        config.command = spec.command.clone();
        config.healthcheck = spec.healthcheck.clone();
        config.working_dir = spec.working_dir.clone();
        config.user = spec.user.clone();
        config.stop_signal = spec.stop_signal.clone();

        config.network_aliases = vec![spec.name.clone()];
        for alias in &spec.network_aliases {
            if !config.network_aliases.contains(alias) {
                config.network_aliases.push(alias.clone());
            }
        }

        Ok(config)
    }

    /// Runtime mounts for `spec`; a bind whose host path does not exist, or
    /// a source that resolved to nothing, is left out and its target pushed
    /// to `skipped`
    fn plan_mounts(&self, spec: &ServiceSpec, skipped: &mut Vec<String>) -> Vec<Mount> {
        let mut mounts = Vec::new();

        for mount in &spec.mounts {
            match &mount.source {
                MountSource::Volume(key) => {
                    if let Some(volume) = self.topology.volumes.get(key) {
                        mounts.push(Mount::Volume {
                            name: volume.name.clone(),
                            target: mount.target.clone(),
                            read_only: mount.read_only,
                        });
                    }
                }
                MountSource::Bind(path) if path.exists() => mounts.push(Mount::Bind {
                    source: path.clone(),
                    target: mount.target.clone(),
                    read_only: mount.read_only,
                }),
                MountSource::Bind(path) => {
                    tracing::warn!(
                        "Host path {} for {}:{} does not exist, not mounting it",
                        path.display(),
                        spec.name,
                        mount.target
                    );
                    skipped.push(mount.target.clone());
                }
                MountSource::Anonymous => mounts.push(Mount::Anonymous {
                    target: mount.target.clone(),
                }),
                MountSource::Unset => {
                    tracing::info!("No source set for {}:{}, not mounting it", spec.name, mount.target);
                    skipped.push(mount.target.clone());
                }
            }
        }

        mounts
    }

    /// Take references on the network and named volumes of `spec`, creating
    /// whatever is used for the first time
    async fn provision(&self, spec: &ServiceSpec) -> Result<()> {
        let _guard = self.provision.lock().await;
        let network = &self.topology.network;

        if self.networks.acquire(network)? == Acquisition::Create {
            tracing::info!("Creating network {}", network.name);
            if let Err(e) = self.runtime.create_network(network).await {
                self.networks.forget(&network.name)?;
                return Err(e);
            }
        }
        self.update_record(&spec.name, |r| r.network = Some(network.name.clone()))?;

        for volume in self.topology.volumes_for(spec) {
            if self.volumes.acquire(volume)? == Acquisition::Create {
                tracing::info!("Creating volume {}", volume.name);
                if let Err(e) = self.runtime.create_volume(volume).await {
                    self.volumes.forget(&volume.name)?;
                    return Err(e);
                }
            }
            self.update_record(&spec.name, |r| r.volumes.push(volume.name.clone()))?;
        }

        Ok(())
    }

    /// Drop the references `service` holds; returns the network name if the
    /// network was removed
    async fn release_resources(&self, service: &str) -> Result<Option<String>> {
        let _guard = self.provision.lock().await;

        let (network, volumes) = {
            let mut records = self
                .records
                .write()
                .map_err(|_| ComposeError::Lock("Failed to acquire write lock".to_string()))?;
            match records.get_mut(service) {
                Some(record) => (record.network.take(), std::mem::take(&mut record.volumes)),
                None => return Ok(None),
            }
        };

        for volume in volumes {
            if let Err(e) = self.volumes.release(&volume) {
                tracing::warn!("Failed to release volume {}: {}", volume, e);
            }
        }

        let Some(network) = network else {
            return Ok(None);
        };
        match self.networks.release(&network) {
            Ok(Release::Remove) => match self.runtime.remove_network(&network).await {
                Ok(()) => {
                    tracing::info!("Removed network {}", network);
                    Ok(Some(network))
                }
                Err(e) => {
                    tracing::warn!("Failed to remove network {}: {}", network, e);
                    Ok(None)
                }
            },
            Ok(Release::Retain) => Ok(None),
            Err(e) => {
                tracing::warn!("Failed to release network {}: {}", network, e);
                Ok(None)
            }
        }
    }

    async fn stop_service(&self, name: &str) -> StopOutcome {
        let record = match self.record(name) {
            Ok(Some(record)) => record,
            Ok(None) => return StopOutcome::NotRunning,
            Err(e) => return StopOutcome::Failed(e.to_string()),
        };
        let Some(id) = record.container_id else {
            return StopOutcome::NotRunning;
        };

        let outcome = match self.runtime.inspect(&id).await {
            Ok(state) if state.status.is_active() => match self.topology.service(name) {
                Ok(spec) => self.stop_container(spec, &id).await,
                Err(e) => StopOutcome::Failed(e.to_string()),
            },
            Ok(_) => StopOutcome::NotRunning,
            Err(ComposeError::ContainerNotFound(_)) => {
                self.forget_container(name, ServiceState::Stopped);
                return StopOutcome::NotRunning;
            }
            Err(e) => return StopOutcome::Failed(e.to_string()),
        };

        if let StopOutcome::Failed(_) = outcome {
            return outcome;
        }
        if let Err(e) = self.runtime.remove(&id).await {
            tracing::warn!("Failed to remove container {}: {}", record.container_name, e);
            return StopOutcome::Failed(e.to_string());
        }

        let state = match outcome {
            StopOutcome::Killed => ServiceState::Killed,
            _ => ServiceState::Stopped,
        };
        self.forget_container(name, state);
        outcome
    }

    fn forget_container(&self, name: &str, state: ServiceState) {
        if let Err(e) = self.update_record(name, |r| {
            r.container_id = None;
            r.state = state;
        }) {
            tracing::warn!("Failed to record state of {}: {}", name, e);
        }
    }

    /// Stop signal, bounded wait, then a single kill
    async fn stop_container(&self, spec: &ServiceSpec, id: &str) -> StopOutcome {
        let grace = spec.stop_grace_period;
        self.set_state(&spec.name, ServiceState::Stopping);
        tracing::info!("Stopping {} with {} (grace period {:?})", spec.name, spec.stop_signal, grace);

        if let Err(e) = self.runtime.signal_stop(id, &spec.stop_signal).await {
            tracing::warn!("Failed to signal {}: {}", spec.name, e);
        }

        match tokio::time::timeout(grace, self.runtime.wait(id)).await {
            Ok(Ok(code)) => {
                tracing::info!("Service {} exited with code {}", spec.name, code);
                StopOutcome::Exited(code)
            }
            Ok(Err(e)) => StopOutcome::Failed(e.to_string()),
            Err(_) => {
                tracing::warn!(
                    "Service {} did not stop within {:?}, killing it",
                    spec.name,
                    grace
                );
                if let Err(e) = self.runtime.kill(id).await {
                    return StopOutcome::Failed(e.to_string());
                }
                if tokio::time::timeout(self.ready_timeout, self.runtime.wait(id))
                    .await
                    .is_err()
                {
                    tracing::warn!("Service {} is still running after kill", spec.name);
                }
                StopOutcome::Killed
            }
        }
    }

    async fn remove_unreferenced_volumes(&self) -> Result<Vec<String>> {
        let _guard = self.provision.lock().await;
        let mut removed = Vec::new();

        for name in self.volumes.unreferenced()? {
            match self.runtime.remove_volume(&name).await {
                Ok(()) => {
                    self.volumes.remove(&name)?;
                    tracing::info!("Removed volume {}", name);
                    removed.push(name);
                }
                Err(ComposeError::VolumeNotFound(_)) => {
                    self.volumes.remove(&name)?;
                }
                Err(e) => tracing::warn!("Failed to remove volume {}: {}", name, e),
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::TopologyLoader;
    use crate::container::{MemoryRuntime, RuntimeEvent, KILLED_EXIT_CODE};
    use std::path::PathBuf;
    use tempfile::TempDir;

    const BROKER_API: &str = r#"
name: demo
services:
  api:
    image: "registry.local/api:${API_TAG:-latest}"
    ports:
      - "8000:8000"
    environment:
      REDIS_URL: "redis://${REDIS_HOST:-broker}:6379/0"
      SECRET_KEY:
    depends_on:
      - broker
    volumes:
      - "${API_SRC_PATH:-}:/opt/src:ro"
    stop_grace_period: 200ms
  broker:
    image: redis:7-alpine
    volumes:
      - broker-data:/data
    stop_grace_period: 200ms
volumes:
  broker-data:
"#;

    fn config() -> LauncherConfig {
        LauncherConfig {
            ready_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
            ..LauncherConfig::ephemeral()
        }
    }

    fn topology(yaml: &str, env: &Environment) -> Topology {
        TopologyLoader::new(PathBuf::from("/srv/demo"), env.clone())
            .load_str(yaml)
            .unwrap()
    }

    fn new_launcher(yaml: &str, runtime: Arc<MemoryRuntime>, env: Environment) -> Launcher {
        Launcher::new(topology(yaml, &env), runtime, env, &config()).unwrap()
    }

    #[tokio::test]
    async fn test_dependencies_start_first() {
        let runtime = Arc::new(MemoryRuntime::new().start_delay(Duration::from_millis(10)));
        let launcher = new_launcher(BROKER_API, runtime.clone(), Environment::new());

        let report = launcher.up().await.unwrap();
        assert!(report.is_success());
        assert_eq!(runtime.started(), vec!["demo-broker-1", "demo-api-1"]);
        assert_eq!(
            runtime.running_when_started("demo-api-1"),
            Some(vec!["demo-broker-1".to_string()])
        );

        let down = launcher.down(false).await.unwrap();
        assert_eq!(down.services["api"], StopOutcome::Exited(0));
        assert_eq!(down.services["broker"], StopOutcome::Exited(0));

        let signals: Vec<String> = runtime
            .events()
            .into_iter()
            .filter_map(|e| match e {
                RuntimeEvent::Signal { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(signals, vec!["demo-api-1", "demo-broker-1"]);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents_only() {
        let yaml = r#"
name: demo
services:
  broker:
    image: redis
  api:
    image: api
    depends_on: [broker]
  worker:
    image: worker
    depends_on: [api]
  metrics:
    image: prom
"#;
        let runtime = Arc::new(MemoryRuntime::new().fail_start("broker"));
        let launcher = new_launcher(yaml, runtime.clone(), Environment::new());

        let report = launcher.up().await.unwrap();
        assert!(!report.is_success());
        assert!(matches!(report.services["broker"], ServiceOutcome::Failed(_)));
        assert_eq!(report.services["api"], ServiceOutcome::Skipped("broker".into()));
        assert_eq!(report.services["worker"], ServiceOutcome::Skipped("api".into()));
        assert_eq!(report.services["metrics"], ServiceOutcome::Running);
        assert_eq!(runtime.started(), vec!["demo-metrics-1"]);

        let broker = launcher.record("broker").unwrap().unwrap();
        assert_eq!(broker.state, ServiceState::Failed);
        assert!(!broker.holds_resources());
    }

    #[test]
    fn test_cycle_starts_nothing() {
        let yaml = r#"
services:
  a: { image: x, depends_on: [b] }
  b: { image: x, depends_on: [a] }
"#;
        let err = TopologyLoader::new(PathBuf::from("/srv/demo"), Environment::new())
            .load_str(yaml)
            .unwrap_err();
        assert!(matches!(err, ComposeError::Cycle(_)));
        assert!(err.is_fatal_load_error());
    }

    #[tokio::test]
    async fn test_missing_bind_path_is_noop_mount() {
        let env = Environment::from_pairs([("API_SRC_PATH", "/definitely/not/here")]);
        let runtime = Arc::new(MemoryRuntime::new());
        let launcher = new_launcher(BROKER_API, runtime.clone(), env);

        let report = launcher.up().await.unwrap();
        assert_eq!(report.services["api"], ServiceOutcome::Running);

        let api = runtime.container_config("demo-api-1").unwrap();
        assert!(api.mounts.is_empty());
        assert_eq!(
            launcher.record("api").unwrap().unwrap().skipped_mounts,
            vec!["/opt/src"]
        );
    }

    #[tokio::test]
    async fn test_existing_bind_path_is_mounted() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().to_string_lossy().to_string();
        let env = Environment::from_pairs([("API_SRC_PATH", src.as_str())]);
        let runtime = Arc::new(MemoryRuntime::new());
        let launcher = new_launcher(BROKER_API, runtime.clone(), env);

        launcher.up().await.unwrap();
        let api = runtime.container_config("demo-api-1").unwrap();
        assert_eq!(
            api.mounts,
            vec![Mount::Bind {
                source: dir.path().to_path_buf(),
                target: "/opt/src".into(),
                read_only: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_stubborn_service_killed_once() {
        let runtime = Arc::new(MemoryRuntime::new().ignore_stop("api"));
        let launcher = new_launcher(BROKER_API, runtime.clone(), Environment::new());
        launcher.up().await.unwrap();

        let report = launcher.down(false).await.unwrap();
        assert_eq!(report.services["api"], StopOutcome::Killed);
        assert_eq!(report.services["broker"], StopOutcome::Exited(0));
        assert_eq!(runtime.kill_count("demo-api-1"), 1);
        assert_eq!(runtime.kill_count("demo-broker-1"), 0);

        // broker is only signalled once api is gone
        let events = runtime.events();
        let api_removed = events
            .iter()
            .position(|e| *e == RuntimeEvent::Removed("demo-api-1".into()))
            .unwrap();
        let broker_signalled = events
            .iter()
            .position(|e| matches!(e, RuntimeEvent::Signal { name, .. } if name == "demo-broker-1"))
            .unwrap();
        assert!(api_removed < broker_signalled);
        assert_eq!(launcher.record("api").unwrap().unwrap().state, ServiceState::Killed);
        assert_ne!(KILLED_EXIT_CODE, 0);
    }

    #[tokio::test]
    async fn test_shared_resources_created_once() {
        let yaml = r#"
name: demo
services:
  a: { image: x, volumes: ["shared:/data"] }
  b: { image: x, volumes: ["shared:/data"] }
  c: { image: x, volumes: ["shared:/data"] }
volumes:
  shared:
"#;
        let runtime = Arc::new(MemoryRuntime::new());
        let launcher = new_launcher(yaml, runtime.clone(), Environment::new());
        launcher.up().await.unwrap();

        let events = runtime.events();
        let created = |wanted: &RuntimeEvent| events.iter().filter(|e| *e == wanted).count();
        assert_eq!(created(&RuntimeEvent::NetworkCreated("demo_default".into())), 1);
        assert_eq!(created(&RuntimeEvent::VolumeCreated("demo_shared".into())), 1);
        assert_eq!(launcher.inner.volumes.get("demo_shared").unwrap().ref_count, 3);
        assert_eq!(launcher.inner.networks.get("demo_default").unwrap().ref_count, 3);
    }

    #[tokio::test]
    async fn test_down_removes_network_and_keeps_volume() {
        let runtime = Arc::new(MemoryRuntime::new());
        let launcher = new_launcher(BROKER_API, runtime.clone(), Environment::new());
        launcher.up().await.unwrap();

        let report = launcher.down(false).await.unwrap();
        assert_eq!(report.networks_removed, vec!["demo_default"]);
        assert!(report.volumes_removed.is_empty());
        assert!(runtime.networks().is_empty());
        assert_eq!(runtime.volumes(), vec!["demo_broker-data"]);

        // a second up reuses the volume
        launcher.up().await.unwrap();
        let created = runtime
            .events()
            .iter()
            .filter(|e| matches!(e, RuntimeEvent::VolumeCreated(_)))
            .count();
        assert_eq!(created, 1);

        let report = launcher.down(true).await.unwrap();
        assert_eq!(report.volumes_removed, vec!["demo_broker-data"]);
        assert!(runtime.volumes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_shared_resources() {
        let yaml = r#"
name: demo
services:
  api:
    image: api
    depends_on: [broker]
    volumes: ["data:/srv/data"]
    stop_grace_period: 200ms
  broker:
    image: redis:7-alpine
    volumes: ["data:/data"]
    stop_grace_period: 200ms
volumes:
  data:
"#;
        let runtime = Arc::new(MemoryRuntime::new().fail_remove("api"));
        let launcher = new_launcher(yaml, runtime.clone(), Environment::new());
        launcher.up().await.unwrap();

        let report = launcher.down(false).await.unwrap();
        assert!(matches!(report.services["api"], StopOutcome::Failed(_)));
        assert_eq!(report.services["broker"], StopOutcome::Exited(0));
        assert!(report.networks_removed.is_empty());

        let api = launcher.record("api").unwrap().unwrap();
        assert!(api.container_id.is_some());
        assert!(api.holds_resources());
        assert!(!launcher.record("broker").unwrap().unwrap().holds_resources());

        assert_eq!(runtime.networks(), vec!["demo_default"]);
        assert_eq!(launcher.inner.networks.get("demo_default").unwrap().ref_count, 1);
        assert_eq!(launcher.inner.volumes.get("demo_data").unwrap().ref_count, 1);

        // the volume is still mounted by api's container
        let report = launcher.down(true).await.unwrap();
        assert!(matches!(report.services["api"], StopOutcome::Failed(_)));
        assert!(report.volumes_removed.is_empty());
        assert_eq!(runtime.volumes(), vec!["demo_data"]);
    }

    #[tokio::test]
    async fn test_independent_services_start_concurrently() {
        let yaml = r#"
name: demo
services:
  a: { image: x }
  b: { image: x }
  c: { image: x }
  d: { image: x }
"#;
        let delay = Duration::from_millis(200);
        let runtime = Arc::new(MemoryRuntime::new().start_delay(delay));
        let launcher = new_launcher(yaml, runtime.clone(), Environment::new());

        let started = std::time::Instant::now();
        let report = launcher.up().await.unwrap();
        let elapsed = started.elapsed();

        assert!(report.is_success());
        assert_eq!(runtime.started().len(), 4);
        assert!(elapsed >= delay);
        assert!(elapsed < delay * 3, "four starts took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_environment_defaults_substituted_at_launch() {
        let runtime = Arc::new(MemoryRuntime::new());
        let launcher = new_launcher(BROKER_API, runtime.clone(), Environment::new());
        launcher.up().await.unwrap();

        let api = runtime.container_config("demo-api-1").unwrap();
        assert_eq!(api.image, "registry.local/api:latest");
        assert_eq!(api.env["REDIS_URL"], "redis://broker:6379/0");
        assert!(!api.env.contains_key("SECRET_KEY"));
        assert_eq!(api.labels[SERVICE_LABEL], "api");
        assert_eq!(api.labels[PROJECT_LABEL], "demo");
        assert_eq!(api.network_aliases, vec!["api"]);

        let runtime = Arc::new(MemoryRuntime::new());
        let env = Environment::from_pairs([("REDIS_HOST", "cache"), ("SECRET_KEY", "s3cret")]);
        let launcher = new_launcher(BROKER_API, runtime.clone(), env);
        launcher.up().await.unwrap();

        let api = runtime.container_config("demo-api-1").unwrap();
        assert_eq!(api.env["REDIS_URL"], "redis://cache:6379/0");
        assert_eq!(api.env["SECRET_KEY"], "s3cret");
    }

    #[tokio::test]
    async fn test_unhealthy_dependency_blocks_dependent() {
        let yaml = r#"
name: demo
services:
  broker:
    image: redis
    healthcheck:
      test: ["CMD", "redis-cli", "ping"]
  api:
    image: api
    depends_on:
      broker:
        condition: service_healthy
"#;
        let runtime = Arc::new(MemoryRuntime::new().unhealthy("broker"));
        let launcher = new_launcher(yaml, runtime.clone(), Environment::new());

        let report = launcher.up().await.unwrap();
        assert!(matches!(report.services["broker"], ServiceOutcome::Failed(_)));
        assert_eq!(report.services["api"], ServiceOutcome::Skipped("broker".into()));
        assert_eq!(runtime.started(), vec!["demo-broker-1"]);

        // the unhealthy container still gets stopped
        let down = launcher.down(false).await.unwrap();
        assert_eq!(down.services["broker"], StopOutcome::Exited(0));
        assert_eq!(down.services["api"], StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_healthy_dependency_releases_dependent() {
        let yaml = r#"
name: demo
services:
  broker:
    image: redis
    healthcheck:
      test: redis-cli ping
  api:
    image: api
    depends_on:
      broker:
        condition: service_healthy
"#;
        let runtime = Arc::new(MemoryRuntime::new());
        let launcher = new_launcher(yaml, runtime.clone(), Environment::new());
        assert!(launcher.up().await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_state_survives_new_launcher() {
        let dir = TempDir::new().unwrap();
        let config = LauncherConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..config()
        };
        let runtime = Arc::new(MemoryRuntime::new());
        let env = Environment::new();

        let first = Launcher::new(topology(BROKER_API, &env), runtime.clone(), env.clone(), &config)
            .unwrap();
        first.up().await.unwrap();
        assert!(dir.path().join("demo.json").exists());
        drop(first);

        let second = Launcher::new(topology(BROKER_API, &env), runtime.clone(), env.clone(), &config)
            .unwrap();
        let status = second.status().await.unwrap();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].service, "broker");
        assert_eq!(status[0].runtime_status, Some(ContainerStatus::Running));

        // up again reuses the running containers
        assert!(second.up().await.unwrap().is_success());
        assert_eq!(runtime.started().len(), 2);

        let report = second.down(true).await.unwrap();
        assert_eq!(report.networks_removed, vec!["demo_default"]);
        assert_eq!(report.volumes_removed, vec!["demo_broker-data"]);
        assert!(!dir.path().join("demo.json").exists());
    }

    #[tokio::test]
    async fn test_down_without_up_is_harmless() {
        let runtime = Arc::new(MemoryRuntime::new());
        let launcher = new_launcher(BROKER_API, runtime.clone(), Environment::new());
        let report = launcher.down(true).await.unwrap();
        assert!(report.services.values().all(|o| *o == StopOutcome::NotRunning));
        assert!(runtime.events().is_empty());
    }

    #[tokio::test]
    async fn test_demo_project() {
        let yaml = include_str!("../../demos/compose.yaml");
        let runtime = Arc::new(MemoryRuntime::new());
        let launcher = new_launcher(yaml, runtime.clone(), Environment::new());

        assert_eq!(launcher.topology().network.name, "demo_backend");
        let report = launcher.up().await.unwrap();
        assert!(report.is_success());
        assert_eq!(runtime.started(), vec!["demo-broker-1", "demo-api-1"]);

        let api = runtime.container_config("demo-api-1").unwrap();
        assert_eq!(api.network, "demo_backend");
        assert_eq!(api.env["LOG_LEVEL"], "info");
        assert_eq!(api.entrypoint.as_ref().unwrap()[0], "sh");

        let statuses = launcher.status().await.unwrap();
        assert_eq!(statuses[0].health, Some(HealthStatus::Healthy));
        assert_eq!(statuses[1].health, None);
    }
}
