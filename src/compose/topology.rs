//! Resolved service topology
//!
//! A [`Topology`] is what the loader produces once a compose file has been
//! validated: every dependency resolves, every named volume is declared and
//! the dependency graph is acyclic.

use super::interpolate::{Environment, Template};
use crate::error::{ComposeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default grace period between stop signal and kill
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Default stop signal
pub const DEFAULT_STOP_SIGNAL: &str = "SIGTERM";

/// An environment value, possibly deferred until launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    /// Fixed value
    Literal(String),
    /// Template rendered against the launch environment
    Deferred(Template),
    /// `KEY` with no value: passed through from the launch environment
    Inherit,
}

impl EnvValue {
    /// Classify a raw value
    pub fn parse(raw: &str) -> Result<Self> {
        let template = Template::parse(raw)?;
        if template.is_literal() {
            Ok(EnvValue::Literal(template.render(&Environment::new())?))
        } else {
            Ok(EnvValue::Deferred(template))
        }
    }

    /// Resolve against `env`; `None` means the variable is left out
    pub fn resolve(&self, key: &str, env: &Environment) -> Result<Option<String>> {
        match self {
            EnvValue::Literal(v) => Ok(Some(v.clone())),
            EnvValue::Deferred(t) => t.render(env).map(Some),
            EnvValue::Inherit => Ok(env.get(key).map(|v| v.to_string())),
        }
    }
}

/// Transport protocol for a published port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    /// Render as a runtime `--publish` argument
    pub fn to_publish_arg(&self) -> String {
        let mut out = String::new();
        if let Some(ip) = &self.host_ip {
            out.push_str(ip);
            out.push(':');
        }
        match self.host_port {
            Some(port) => out.push_str(&format!("{}:", port)),
            None if self.host_ip.is_some() => out.push(':'),
            None => {}
        }
        out.push_str(&format!("{}/{}", self.container_port, self.protocol));
        out
    }
}

/// Where a mount's data comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Declared named volume, by key
    Volume(String),
    /// Host path
    Bind(PathBuf),
    /// Anonymous volume created by the runtime
    Anonymous,
    /// The source expression resolved to nothing; mounted as a no-op
    Unset,
}

/// A volume mount on a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

/// Readiness a dependent waits for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Container is running
    #[default]
    ServiceStarted,
    /// Container reports healthy
    ServiceHealthy,
}

impl DependencyCondition {
    /// Parse the compose condition string
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw {
            None | Some("service_started") => Ok(DependencyCondition::ServiceStarted),
            Some("service_healthy") => Ok(DependencyCondition::ServiceHealthy),
            Some(other) => Err(ComposeError::Parse(format!(
                "unsupported depends_on condition '{}'",
                other
            ))),
        }
    }
}

/// Dependency edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub service: String,
    pub condition: DependencyCondition,
}

/// Healthcheck definition handed to the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthcheckSpec {
    pub test: Vec<String>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub start_period: Option<Duration>,
}

/// A fully resolved service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub container_name: Option<String>,
    pub ports: Vec<PortMapping>,
    pub environment: BTreeMap<String, EnvValue>,
    pub depends_on: Vec<Dependency>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    pub mounts: Vec<MountSpec>,
    pub healthcheck: Option<HealthcheckSpec>,
    pub network_aliases: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub stop_signal: String,
    pub stop_grace_period: Duration,
}

impl ServiceSpec {
    /// Minimal service, mostly for tests and programmatic topologies
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            container_name: None,
            ports: Vec::new(),
            environment: BTreeMap::new(),
            depends_on: Vec::new(),
            entrypoint: None,
            command: None,
            mounts: Vec::new(),
            healthcheck: None,
            network_aliases: Vec::new(),
            labels: BTreeMap::new(),
            working_dir: None,
            user: None,
            stop_signal: DEFAULT_STOP_SIGNAL.to_string(),
            stop_grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Add a `service_started` dependency
    pub fn depends_on(mut self, service: &str) -> Self {
        self.depends_on.push(Dependency {
            service: service.to_string(),
            condition: DependencyCondition::ServiceStarted,
        });
        self
    }

    /// Set the grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Names of direct dependencies
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.depends_on.iter().map(|d| d.service.as_str())
    }

    /// Render environment values for launch
    pub fn resolve_environment(&self, env: &Environment) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.environment {
            if let Some(v) = value.resolve(key, env)? {
                out.insert(key.clone(), v);
            }
        }
        Ok(out)
    }
}

/// A named volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Key in the compose file
    pub key: String,
    /// Name used with the runtime
    pub name: String,
    /// Backing store driver
    pub driver: String,
    /// Managed outside this project
    pub external: bool,
    pub labels: BTreeMap<String, String>,
}

/// The shared network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Key in the compose file
    pub key: String,
    /// Name used with the runtime
    pub name: String,
    pub driver: String,
    /// Managed outside this project
    pub external: bool,
    pub labels: BTreeMap<String, String>,
}

/// The full set of services, volumes and the network
#[derive(Debug, Clone)]
pub struct Topology {
    pub project: String,
    pub services: BTreeMap<String, ServiceSpec>,
    pub volumes: BTreeMap<String, VolumeSpec>,
    pub network: NetworkSpec,
}

impl Topology {
    /// Assemble a topology, checking references and acyclicity
    pub fn new(
        project: &str,
        services: Vec<ServiceSpec>,
        volumes: Vec<VolumeSpec>,
        network: NetworkSpec,
    ) -> Result<Self> {
        let topology = Self {
            project: project.to_string(),
            services: services.into_iter().map(|s| (s.name.clone(), s)).collect(),
            volumes: volumes.into_iter().map(|v| (v.key.clone(), v)).collect(),
            network,
        };
        topology.check_references()?;
        topology.start_order()?;
        Ok(topology)
    }

    /// Get a service
    pub fn service(&self, name: &str) -> Result<&ServiceSpec> {
        self.services
            .get(name)
            .ok_or_else(|| ComposeError::ServiceNotFound(name.to_string()))
    }

    fn check_references(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(ComposeError::Parse("no services defined".to_string()));
        }

        for (name, service) in &self.services {
            for dep in &service.depends_on {
                if dep.service == *name {
                    return Err(ComposeError::Parse(format!(
                        "Service '{}' depends on itself",
                        name
                    )));
                }
                let target = self.services.get(&dep.service).ok_or_else(|| {
                    ComposeError::Parse(format!(
                        "Service '{}' depends on unknown service '{}'",
                        name, dep.service
                    ))
                })?;
                if dep.condition == DependencyCondition::ServiceHealthy
                    && target.healthcheck.is_none()
                {
                    return Err(ComposeError::Parse(format!(
                        "Service '{}' waits for '{}' to be healthy but '{}' has no healthcheck",
                        name, dep.service, dep.service
                    )));
                }
            }

            for mount in &service.mounts {
                if let MountSource::Volume(key) = &mount.source {
                    if !self.volumes.contains_key(key) {
                        return Err(ComposeError::Parse(format!(
                            "Service '{}' refers to undefined volume '{}'",
                            name, key
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Services grouped by dependency depth: level 0 has no dependencies,
    /// level n depends only on levels below n
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = self
            .services
            .iter()
            .map(|(name, s)| (name.as_str(), s.dependency_names().collect()))
            .collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| *name)
                .collect();

            if ready.is_empty() {
                return Err(ComposeError::Cycle(self.find_cycle(&remaining)));
            }

            for name in &ready {
                remaining.remove(name);
            }
            for deps in remaining.values_mut() {
                for name in &ready {
                    deps.remove(name);
                }
            }
            levels.push(ready.into_iter().map(String::from).collect());
        }

        Ok(levels)
    }

    /// Dependencies before dependents, ties broken by name
    pub fn start_order(&self) -> Result<Vec<String>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Reverse of the start order
    pub fn stop_order(&self) -> Result<Vec<String>> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }

    /// Services that list `name` as a direct dependency
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.services
            .values()
            .filter(|s| s.dependency_names().any(|d| d == name))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Walk the unresolved subgraph until a node repeats
    fn find_cycle(&self, remaining: &BTreeMap<&str, BTreeSet<&str>>) -> Vec<String> {
        let Some(&start) = remaining.keys().next() else {
            return Vec::new();
        };
        let mut path: Vec<&str> = vec![start];
        let mut current = start;

        loop {
            let next = remaining
                .get(current)
                .and_then(|deps| deps.iter().next())
                .copied();
            let Some(next) = next else {
                return path.into_iter().map(String::from).collect();
            };
            if let Some(pos) = path.iter().position(|n| *n == next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.to_string());
                return cycle;
            }
            path.push(next);
            current = next;
        }
    }

    /// Named volumes referenced by `service`
    pub fn volumes_for(&self, service: &ServiceSpec) -> Vec<&VolumeSpec> {
        let mut seen = BTreeSet::new();
        service
            .mounts
            .iter()
            .filter_map(|m| match &m.source {
                MountSource::Volume(key) if seen.insert(key.clone()) => self.volumes.get(key),
                _ => None,
            })
            .collect()
    }
}
