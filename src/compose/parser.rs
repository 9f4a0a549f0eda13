//! Compose file parser and topology loader

use super::config::{
    CommandConfig, ComposeConfig, EnvironmentConfig, HealthcheckConfig, PortConfig, Scalar,
    ServiceConfig, VolumeMount,
};
use super::interpolate::{interpolate, Environment};
use super::topology::{
    Dependency, DependencyCondition, EnvValue, HealthcheckSpec, MountSource, MountSpec,
    NetworkSpec, PortMapping, Protocol, ServiceSpec, Topology, VolumeSpec, DEFAULT_GRACE_PERIOD,
    DEFAULT_STOP_SIGNAL,
};
use crate::error::{ComposeError, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Key of the implicit network when none is declared
pub const DEFAULT_NETWORK_KEY: &str = "default";

static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(h|ms|us|m|s)").expect("duration pattern is valid")
});

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Parse compose file from path
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ComposeError::Parse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content)
    }

    /// Parse compose file from string
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| ComposeError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Parse multiple compose files (with merging)
    pub fn parse_files(paths: &[PathBuf]) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            let file_config = Self::parse_file(path)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two compose configurations; the overlay wins field by field
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.get_mut(&name) {
                Some(existing) => merge_service(existing, service),
                None => {
                    result.services.insert(name, service);
                }
            }
        }

        result.networks.extend(overlay.networks);
        result.volumes.extend(overlay.volumes);

        result
    }

    /// Non-fatal findings about a configuration
    pub fn validate(config: &ComposeConfig) -> Vec<String> {
        let mut warnings = Vec::new();

        let mut used_volumes = BTreeSet::new();
        for service in config.services.values() {
            for mount in service.volumes.iter().flatten() {
                let source = match mount {
                    VolumeMount::Short(s) => s.split(':').next().map(|s| s.to_string()),
                    VolumeMount::Long(l) => l.source.clone(),
                };
                if let Some(source) = source {
                    used_volumes.insert(source);
                }
            }
        }
        for name in config.volumes.keys() {
            if !used_volumes.contains(name) {
                warnings.push(format!("Volume '{}' is declared but not used", name));
            }
        }

        let mut published: BTreeMap<String, &str> = BTreeMap::new();
        for (name, service) in &config.services {
            for port in service.ports.iter().flatten() {
                let key = match port {
                    PortConfig::Short(s) if s.contains(':') => s.rsplit_once(':').map(|(h, _)| h.to_string()),
                    PortConfig::Long(l) => l.published.as_ref().map(|p| p.to_string()),
                    _ => None,
                };
                if let Some(key) = key {
                    if let Some(other) = published.insert(key.clone(), name) {
                        warnings.push(format!(
                            "Services '{}' and '{}' both publish host port {}",
                            other, name, key
                        ));
                    }
                }
            }
            if service.image.is_none() {
                warnings.push(format!("Service '{}' has no image", name));
            }
        }

        warnings
    }
}

fn merge_service(existing: &mut ServiceConfig, overlay: ServiceConfig) {
    macro_rules! take {
        ($($field:ident),*) => {
            $(if overlay.$field.is_some() {
                existing.$field = overlay.$field;
            })*
        };
    }

    if let Some(env) = overlay.environment {
        match (&mut existing.environment, env) {
            (Some(EnvironmentConfig::Map(base)), EnvironmentConfig::Map(extra)) => {
                base.extend(extra);
            }
            (slot, env) => *slot = Some(env),
        }
    }

    take!(
        image,
        command,
        entrypoint,
        container_name,
        ports,
        volumes,
        networks,
        depends_on,
        healthcheck,
        labels,
        working_dir,
        user,
        stop_signal,
        stop_grace_period
    );
}

/// Turns a [`ComposeConfig`] into a validated [`Topology`]
pub struct TopologyLoader {
    working_dir: PathBuf,
    environment: Environment,
    project_name: Option<String>,
}

impl TopologyLoader {
    /// Loader resolving relative paths against `working_dir`
    pub fn new(working_dir: PathBuf, environment: Environment) -> Self {
        Self {
            working_dir,
            environment,
            project_name: None,
        }
    }

    /// Project name used when the file does not set one
    pub fn project_name(mut self, name: Option<String>) -> Self {
        self.project_name = name;
        self
    }

    /// Environment used for interpolation
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Parse, merge and resolve `paths`
    pub fn load_files(&self, paths: &[PathBuf]) -> Result<Topology> {
        let config = ComposeParser::parse_files(paths)?;
        self.resolve(&config)
    }

    /// Parse and resolve a single document
    pub fn load_str(&self, content: &str) -> Result<Topology> {
        let config = ComposeParser::parse_str(content)?;
        self.resolve(&config)
    }

    /// Resolve a parsed configuration
    pub fn resolve(&self, config: &ComposeConfig) -> Result<Topology> {
        let project = self.resolve_project_name(config)?;
        let network = self.resolve_network(&project, config)?;

        let mut volumes = Vec::new();
        for (key, volume) in &config.volumes {
            let cfg = volume.clone().unwrap_or_default();
            let external = cfg.external.as_ref().map(|e| e.is_external()).unwrap_or(false);
            let name = cfg
                .name
                .clone()
                .or_else(|| cfg.external.as_ref().and_then(|e| e.name()).map(String::from))
                .unwrap_or_else(|| {
                    if external {
                        key.clone()
                    } else {
                        format!("{}_{}", project, key)
                    }
                });
            volumes.push(VolumeSpec {
                key: key.clone(),
                name: self.interpolate(&name)?,
                driver: cfg.driver.unwrap_or_else(|| "local".to_string()),
                external,
                labels: cfg.labels.map(|l| l.to_map()).unwrap_or_default(),
            });
        }

        let mut services = Vec::new();
        for (name, service) in &config.services {
            services.push(self.resolve_service(name, service, &network)?);
        }

        let topology = Topology::new(&project, services, volumes, network)?;
        tracing::debug!(
            "Loaded project {} with {} services",
            topology.project,
            topology.services.len()
        );
        Ok(topology)
    }

    fn interpolate(&self, raw: &str) -> Result<String> {
        interpolate(raw, &self.environment)
    }

    fn resolve_project_name(&self, config: &ComposeConfig) -> Result<String> {
        let raw = match (&config.name, &self.project_name) {
            (Some(name), _) => self.interpolate(name)?,
            (None, Some(name)) => name.clone(),
            (None, None) => self
                .working_dir
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("default")
                .to_string(),
        };
        normalize_project_name(&raw)
    }

    fn resolve_network(&self, project: &str, config: &ComposeConfig) -> Result<NetworkSpec> {
        if config.networks.len() > 1 {
            return Err(ComposeError::Parse(format!(
                "only a single network is supported, found {}",
                config.networks.len()
            )));
        }

        let Some((key, cfg)) = config.networks.iter().next() else {
            return Ok(NetworkSpec {
                key: DEFAULT_NETWORK_KEY.to_string(),
                name: format!("{}_{}", project, DEFAULT_NETWORK_KEY),
                driver: "bridge".to_string(),
                external: false,
                labels: BTreeMap::new(),
            });
        };

        let cfg = cfg.clone().unwrap_or_default();
        let external = cfg.external.as_ref().map(|e| e.is_external()).unwrap_or(false);
        let name = cfg
            .name
            .clone()
            .or_else(|| cfg.external.as_ref().and_then(|e| e.name()).map(String::from))
            .unwrap_or_else(|| {
                if external {
                    key.clone()
                } else {
                    format!("{}_{}", project, key)
                }
            });

        Ok(NetworkSpec {
            key: key.clone(),
            name: self.interpolate(&name)?,
            driver: cfg.driver.unwrap_or_else(|| "bridge".to_string()),
            external,
            labels: cfg.labels.map(|l| l.to_map()).unwrap_or_default(),
        })
    }

    fn resolve_service(
        &self,
        name: &str,
        service: &ServiceConfig,
        network: &NetworkSpec,
    ) -> Result<ServiceSpec> {
        let context = |e: ComposeError| match e {
            ComposeError::Parse(msg) => ComposeError::Parse(format!("service '{}': {}", name, msg)),
            other => other,
        };

        let image = service.image.as_deref().ok_or_else(|| {
            ComposeError::Parse(format!("Service '{}' must have 'image' specified", name))
        })?;

        let mut spec = ServiceSpec::new(name, &self.interpolate(image).map_err(context)?);
        spec.container_name = service.container_name.clone();
        spec.working_dir = service.working_dir.clone();
        spec.user = service.user.clone();
        spec.labels = service.labels.as_ref().map(|l| l.to_map()).unwrap_or_default();

        for port in service.ports.iter().flatten() {
            spec.ports.push(self.parse_port(port).map_err(context)?);
        }

        spec.environment = parse_environment(service.environment.as_ref()).map_err(context)?;

        if let Some(depends) = &service.depends_on {
            for (dep, condition) in depends.entries() {
                spec.depends_on.push(Dependency {
                    service: dep,
                    condition: DependencyCondition::parse(condition.as_deref()).map_err(context)?,
                });
            }
        }

        spec.entrypoint = service
            .entrypoint
            .as_ref()
            .map(command_words)
            .transpose()
            .map_err(context)?;
        spec.command = service
            .command
            .as_ref()
            .map(command_words)
            .transpose()
            .map_err(context)?;

        for mount in service.volumes.iter().flatten() {
            spec.mounts.push(self.parse_mount(mount).map_err(context)?);
        }

        spec.healthcheck = service
            .healthcheck
            .as_ref()
            .map(parse_healthcheck)
            .transpose()
            .map_err(context)?
            .flatten();

        if let Some(networks) = &service.networks {
            for key in networks.names() {
                if key != network.key {
                    return Err(ComposeError::Parse(format!(
                        "Service '{}' refers to undefined network '{}'",
                        name, key
                    )));
                }
            }
            spec.network_aliases = networks.aliases(&network.key);
        }

        spec.stop_signal = service
            .stop_signal
            .clone()
            .unwrap_or_else(|| DEFAULT_STOP_SIGNAL.to_string());
        spec.stop_grace_period = match &service.stop_grace_period {
            Some(raw) => parse_duration(raw).map_err(context)?,
            None => DEFAULT_GRACE_PERIOD,
        };

        Ok(spec)
    }

    fn parse_port(&self, port: &PortConfig) -> Result<PortMapping> {
        match port {
            PortConfig::Number(p) => Ok(PortMapping {
                host_ip: None,
                host_port: None,
                container_port: *p,
                protocol: Protocol::Tcp,
            }),
            PortConfig::Short(raw) => parse_port_short(&self.interpolate(raw)?),
            PortConfig::Long(long) => {
                let host_port = match &long.published {
                    None => None,
                    Some(Scalar::Int(p)) => Some(port_number(&p.to_string())?),
                    Some(Scalar::String(s)) => {
                        let s = self.interpolate(s)?;
                        if s.is_empty() {
                            None
                        } else {
                            Some(port_number(&s)?)
                        }
                    }
                    Some(other) => {
                        return Err(ComposeError::Parse(format!("invalid published port '{}'", other)))
                    }
                };
                Ok(PortMapping {
                    host_ip: long.host_ip.clone(),
                    host_port,
                    container_port: long.target,
                    protocol: parse_protocol(long.protocol.as_deref())?,
                })
            }
        }
    }

    fn parse_mount(&self, mount: &VolumeMount) -> Result<MountSpec> {
        let (source, target, read_only, mount_type) = match mount {
            VolumeMount::Short(raw) => {
                let resolved = self.interpolate(raw)?;
                let parts: Vec<&str> = resolved.split(':').collect();
                match parts.as_slice() {
                    [target] => (None, target.to_string(), false, None),
                    [source, target] => (Some(source.to_string()), target.to_string(), false, None),
                    [source, target, mode] => {
                        let read_only = mode.split(',').any(|m| m == "ro");
                        (Some(source.to_string()), target.to_string(), read_only, None)
                    }
                    _ => {
                        return Err(ComposeError::Parse(format!(
                            "invalid volume specification '{}'",
                            resolved
                        )))
                    }
                }
            }
            VolumeMount::Long(long) => (
                long.source.as_deref().map(|s| self.interpolate(s)).transpose()?,
                self.interpolate(&long.target)?,
                long.read_only.unwrap_or(false),
                long.mount_type.clone(),
            ),
        };

        if !target.starts_with('/') {
            return Err(ComposeError::Parse(format!(
                "volume target '{}' must be an absolute path",
                target
            )));
        }

        let source = match (mount_type.as_deref(), source) {
            (Some("volume"), None) => MountSource::Anonymous,
            (Some("volume"), Some(s)) if s.is_empty() => MountSource::Anonymous,
            (Some("volume"), Some(s)) => MountSource::Volume(s),
            (Some("bind"), None) => MountSource::Unset,
            (Some("bind"), Some(s)) if s.is_empty() => MountSource::Unset,
            (Some("bind"), Some(s)) => MountSource::Bind(self.host_path(&s)),
            (Some(other), _) => {
                return Err(ComposeError::Parse(format!("unsupported mount type '{}'", other)))
            }
            (None, None) => MountSource::Anonymous,
            (None, Some(s)) if s.is_empty() => MountSource::Unset,
            (None, Some(s)) if is_path_like(&s) => MountSource::Bind(self.host_path(&s)),
            (None, Some(s)) => MountSource::Volume(s),
        };

        Ok(MountSpec {
            source,
            target,
            read_only,
        })
    }

    fn host_path(&self, raw: &str) -> PathBuf {
        if let Some(rest) = raw.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }
}

fn is_path_like(s: &str) -> bool {
    s.starts_with('/') || s.starts_with('.') || s.starts_with('~')
}

fn parse_environment(env: Option<&EnvironmentConfig>) -> Result<BTreeMap<String, EnvValue>> {
    let mut out = BTreeMap::new();
    match env {
        None => {}
        Some(EnvironmentConfig::Array(items)) => {
            for item in items {
                match item.split_once('=') {
                    Some((key, value)) => {
                        out.insert(key.to_string(), EnvValue::parse(value)?);
                    }
                    None => {
                        out.insert(item.clone(), EnvValue::Inherit);
                    }
                }
            }
        }
        Some(EnvironmentConfig::Map(map)) => {
            for (key, value) in map {
                let value = match value {
                    None => EnvValue::Inherit,
                    Some(Scalar::String(s)) => EnvValue::parse(s)?,
                    Some(other) => EnvValue::Literal(other.to_string()),
                };
                out.insert(key.clone(), value);
            }
        }
    }
    Ok(out)
}

fn command_words(command: &CommandConfig) -> Result<Vec<String>> {
    match command {
        CommandConfig::Exec(args) => Ok(args.clone()),
        CommandConfig::Shell(line) => split_command(line),
    }
}

fn parse_healthcheck(cfg: &HealthcheckConfig) -> Result<Option<HealthcheckSpec>> {
    if cfg.disable.unwrap_or(false) {
        return Ok(None);
    }
    let test = match &cfg.test {
        None => return Ok(None),
        Some(CommandConfig::Shell(line)) => vec!["CMD-SHELL".to_string(), line.clone()],
        Some(CommandConfig::Exec(args)) => args.clone(),
    };
    if test.first().map(|s| s == "NONE").unwrap_or(true) {
        return Ok(None);
    }

    let duration = |raw: &Option<String>| raw.as_deref().map(parse_duration).transpose();
    Ok(Some(HealthcheckSpec {
        test,
        interval: duration(&cfg.interval)?,
        timeout: duration(&cfg.timeout)?,
        retries: cfg.retries,
        start_period: duration(&cfg.start_period)?,
    }))
}

fn parse_protocol(raw: Option<&str>) -> Result<Protocol> {
    match raw {
        None | Some("tcp") => Ok(Protocol::Tcp),
        Some("udp") => Ok(Protocol::Udp),
        Some(other) => Err(ComposeError::Parse(format!("unsupported protocol '{}'", other))),
    }
}

fn port_number(raw: &str) -> Result<u16> {
    if raw.contains('-') {
        return Err(ComposeError::Parse(format!(
            "port ranges are not supported: '{}'",
            raw
        )));
    }
    raw.parse::<u16>()
        .map_err(|_| ComposeError::Parse(format!("invalid port '{}'", raw)))
}

/// Parse `[[ip:]host:]container[/proto]`
pub fn parse_port_short(raw: &str) -> Result<PortMapping> {
    let (mapping, protocol) = match raw.split_once('/') {
        Some((m, p)) => (m, parse_protocol(Some(p))?),
        None => (raw, Protocol::Tcp),
    };

    let parts: Vec<&str> = mapping.split(':').collect();
    let (host_ip, host_port, container) = match parts.as_slice() {
        [container] => (None, None, *container),
        [host, container] => (None, Some(*host), *container),
        [ip, host, container] => (Some(ip.to_string()), Some(*host), *container),
        _ => {
            return Err(ComposeError::Parse(format!("invalid port mapping '{}'", raw)));
        }
    };

    let host_port = match host_port {
        Some(h) if !h.is_empty() => Some(port_number(h)?),
        _ => None,
    };

    Ok(PortMapping {
        host_ip: host_ip.filter(|ip| !ip.is_empty()),
        host_port,
        container_port: port_number(container)?,
        protocol,
    })
}

/// Parse a compose duration such as `10s`, `1m30s`, `500ms` or `1.5s`.
/// A bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let invalid = || ComposeError::Parse(format!("invalid duration '{}'", raw));

    if raw.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| invalid());
    }

    let mut total = 0f64;
    let mut covered = 0;
    for caps in DURATION_PART.captures_iter(raw) {
        let whole = caps.get(0).ok_or_else(invalid)?;
        if whole.start() != covered {
            return Err(invalid());
        }
        covered = whole.end();

        let value: f64 = caps[1].parse().map_err(|_| invalid())?;
        let scale = match &caps[2] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            _ => 0.000_001,
        };
        total += value * scale;
    }

    if covered != raw.len() {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}

/// Split a shell-style command line into words, honouring quotes and
/// backslash escapes
pub fn split_command(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => {
                            return Err(ComposeError::Parse(format!(
                                "unterminated single quote in '{}'",
                                line
                            )))
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => break,
                        },
                        Some(ch) => current.push(ch),
                        None => {
                            return Err(ComposeError::Parse(format!(
                                "unterminated double quote in '{}'",
                                line
                            )))
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Lowercase and strip characters the runtime rejects in resource names
pub fn normalize_project_name(raw: &str) -> Result<String> {
    let name: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let name = name.trim_start_matches(['_', '-']).to_string();
    if name.is_empty() {
        return Err(ComposeError::InvalidConfig(format!(
            "project name '{}' has no usable characters",
            raw
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROKER_API: &str = r#"
name: demo
services:
  api:
    image: "registry.local/api:${API_TAG:-latest}"
    ports:
      - "8000:8000"
    environment:
      REDIS_URL: "redis://${REDIS_HOST:-broker}:6379/0"
      WORKERS: 4
      SECRET_KEY:
    depends_on:
      - broker
    volumes:
      - "${API_SRC_PATH:-}:/opt/src:ro"
    entrypoint: sh -c "exec uvicorn app:main --host 0.0.0.0"
    stop_grace_period: 30s
  broker:
    image: redis:7-alpine
    ports:
      - "6379:6379"
    volumes:
      - broker-data:/data
volumes:
  broker-data:
"#;

    fn loader(env: Environment) -> TopologyLoader {
        TopologyLoader::new(PathBuf::from("/srv/demo"), env)
    }

    #[test]
    fn test_parse_simple_compose() {
        let config = ComposeParser::parse_str(BROKER_API).unwrap();
        assert_eq!(config.services.len(), 2);
        assert!(config.services.contains_key("api"));
        assert!(config.services.contains_key("broker"));
    }

    #[test]
    fn test_load_broker_api() {
        let topology = loader(Environment::new()).load_str(BROKER_API).unwrap();

        assert_eq!(topology.project, "demo");
        assert_eq!(topology.start_order().unwrap(), vec!["broker", "api"]);
        assert_eq!(topology.network.name, "demo_default");
        assert_eq!(topology.volumes["broker-data"].name, "demo_broker-data");

        let api = topology.service("api").unwrap();
        assert_eq!(api.image, "registry.local/api:latest");
        assert_eq!(api.stop_grace_period, Duration::from_secs(30));
        assert_eq!(
            api.entrypoint.as_deref().unwrap(),
            ["sh", "-c", "exec uvicorn app:main --host 0.0.0.0"]
        );
        assert_eq!(api.mounts[0].source, MountSource::Unset);
        assert!(api.mounts[0].read_only);
        assert_eq!(api.environment["WORKERS"], EnvValue::Literal("4".into()));
        assert_eq!(api.environment["SECRET_KEY"], EnvValue::Inherit);
        assert!(matches!(api.environment["REDIS_URL"], EnvValue::Deferred(_)));

        let broker = topology.service("broker").unwrap();
        assert_eq!(broker.mounts[0].source, MountSource::Volume("broker-data".into()));
        assert_eq!(broker.stop_grace_period, DEFAULT_GRACE_PERIOD);
    }

    #[test]
    fn test_conditional_mount_resolves_when_set() {
        let env = Environment::from_pairs([("API_SRC_PATH", "./src"), ("API_TAG", "1.2")]);
        let topology = loader(env).load_str(BROKER_API).unwrap();
        let api = topology.service("api").unwrap();
        assert_eq!(api.image, "registry.local/api:1.2");
        assert_eq!(
            api.mounts[0].source,
            MountSource::Bind(PathBuf::from("/srv/demo/./src"))
        );
    }

    #[test]
    fn test_missing_image_is_parse_error() {
        let yaml = r#"
services:
  web:
    ports:
      - "80:80"
"#;
        let err = loader(Environment::new()).load_str(yaml).unwrap_err();
        assert!(matches!(err, ComposeError::Parse(_)));
    }

    #[test]
    fn test_unresolved_dependency_is_parse_error() {
        let yaml = r#"
services:
  api:
    image: api
    depends_on: [broker]
"#;
        let err = loader(Environment::new()).load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown service 'broker'"));
    }

    #[test]
    fn test_cycle_fails_load() {
        let yaml = r#"
services:
  a:
    image: nginx
    depends_on: [b]
  b:
    image: nginx
    depends_on: [a]
"#;
        let err = loader(Environment::new()).load_str(yaml).unwrap_err();
        assert!(matches!(err, ComposeError::Cycle(_)));
    }

    #[test]
    fn test_undeclared_named_volume() {
        let yaml = r#"
services:
  broker:
    image: redis
    volumes: ["data:/data"]
"#;
        let err = loader(Environment::new()).load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("undefined volume 'data'"));
    }

    #[test]
    fn test_single_network_only() {
        let yaml = r#"
services:
  broker:
    image: redis
networks:
  front: {}
  back: {}
"#;
        assert!(loader(Environment::new()).load_str(yaml).is_err());

        let yaml = r#"
services:
  broker:
    image: redis
    networks:
      backend:
        aliases: [cache]
networks:
  backend:
    external: true
"#;
        let topology = loader(Environment::new()).load_str(yaml).unwrap();
        assert_eq!(topology.network.name, "backend");
        assert!(topology.network.external);
        assert_eq!(topology.service("broker").unwrap().network_aliases, vec!["cache"]);
    }

    #[test]
    fn test_project_name_falls_back_to_directory() {
        let yaml = "services:\n  broker:\n    image: redis\n";
        let topology = TopologyLoader::new(PathBuf::from("/work/My App"), Environment::new())
            .load_str(yaml)
            .unwrap();
        assert_eq!(topology.project, "myapp");

        let topology = TopologyLoader::new(PathBuf::from("/work/x"), Environment::new())
            .project_name(Some("override".into()))
            .load_str(yaml)
            .unwrap();
        assert_eq!(topology.project, "override");
    }

    #[test]
    fn test_healthcheck_and_condition() {
        let yaml = r#"
services:
  api:
    image: api
    depends_on:
      broker:
        condition: service_healthy
  broker:
    image: redis
    healthcheck:
      test: ["CMD", "redis-cli", "ping"]
      interval: 5s
      timeout: 1s
      retries: 5
"#;
        let topology = loader(Environment::new()).load_str(yaml).unwrap();
        let broker = topology.service("broker").unwrap();
        let hc = broker.healthcheck.as_ref().unwrap();
        assert_eq!(hc.test, vec!["CMD", "redis-cli", "ping"]);
        assert_eq!(hc.interval, Some(Duration::from_secs(5)));
        assert_eq!(
            topology.service("api").unwrap().depends_on[0].condition,
            DependencyCondition::ServiceHealthy
        );
    }

    #[test]
    fn test_parse_ports() {
        let p = parse_port_short("8000:80").unwrap();
        assert_eq!((p.host_port, p.container_port), (Some(8000), 80));
        let p = parse_port_short("127.0.0.1:53:53/udp").unwrap();
        assert_eq!(p.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(p.protocol, Protocol::Udp);
        let p = parse_port_short("6379").unwrap();
        assert_eq!((p.host_port, p.container_port), (None, 6379));
        assert!(parse_port_short("8000-8001:80").is_err());
        assert!(parse_port_short("abc").is_err());
        assert!(parse_port_short("1:2:3:4").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10 s").is_err());
        assert!(parse_duration("tens").is_err());
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command(r#"sh -c 'pip install -e /opt/src && exec app'"#).unwrap(),
            vec!["sh", "-c", "pip install -e /opt/src && exec app"]
        );
        assert_eq!(
            split_command(r#"echo "a \"b\"" c\ d"#).unwrap(),
            vec!["echo", r#"a "b""#, "c d"]
        );
        assert_eq!(split_command("  ").unwrap(), Vec::<String>::new());
        assert_eq!(split_command("''").unwrap(), vec![""]);
        assert!(split_command("'open").is_err());
    }

    #[test]
    fn test_merge_overlay_wins() {
        let base = ComposeParser::parse_str(
            r#"
services:
  api:
    image: api:1
    environment:
      A: "1"
      B: "2"
"#,
        )
        .unwrap();
        let overlay = ComposeParser::parse_str(
            r#"
services:
  api:
    image: api:2
    environment:
      B: "3"
  broker:
    image: redis
"#,
        )
        .unwrap();

        let merged = ComposeParser::merge_configs(base, overlay);
        let api = &merged.services["api"];
        assert_eq!(api.image.as_deref(), Some("api:2"));
        let Some(EnvironmentConfig::Map(env)) = &api.environment else {
            panic!("expected map environment");
        };
        assert_eq!(env["A"], Some(Scalar::String("1".into())));
        assert_eq!(env["B"], Some(Scalar::String("3".into())));
        assert!(merged.services.contains_key("broker"));
    }

    #[test]
    fn test_validate_warnings() {
        let config = ComposeParser::parse_str(
            r#"
services:
  a:
    image: x
    ports: ["8000:80"]
  b:
    image: y
    ports: ["8000:81"]
volumes:
  unused:
"#,
        )
        .unwrap();
        let warnings = ComposeParser::validate(&config);
        assert!(warnings.iter().any(|w| w.contains("'unused'")));
        assert!(warnings.iter().any(|w| w.contains("host port 8000")));
    }

    #[test]
    fn test_find_compose_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ComposeParser::find_compose_file(dir.path()).is_none());
        std::fs::write(dir.path().join("docker-compose.yml"), "services: {}").unwrap();
        assert_eq!(
            ComposeParser::find_compose_file(dir.path()).unwrap(),
            dir.path().join("docker-compose.yml")
        );
    }
}
