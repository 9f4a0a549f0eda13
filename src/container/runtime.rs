//! Container runtime seam
//!
//! [`ContainerRuntime`] is everything the launcher asks of the engine that
//! actually runs containers. [`CliRuntime`] drives a docker-compatible
//! command line; [`crate::container::MemoryRuntime`] keeps everything
//! in-process.

use super::config::{ContainerConfig, ContainerState, ContainerStatus, HealthStatus, Mount};
use crate::compose::topology::{NetworkSpec, VolumeSpec};
use crate::error::{ComposeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;

/// Operations the launcher needs from a container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a network
    async fn create_network(&self, network: &NetworkSpec) -> Result<()>;

    /// Remove a network
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Create a named volume
    async fn create_volume(&self, volume: &VolumeSpec) -> Result<()>;

    /// Remove a named volume
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Create and start a container, returning its ID
    async fn run(&self, config: &ContainerConfig) -> Result<String>;

    /// Current state of a container
    async fn inspect(&self, id: &str) -> Result<ContainerState>;

    /// Deliver the cooperative stop signal
    async fn signal_stop(&self, id: &str, signal: &str) -> Result<()>;

    /// Block until the container exits, returning the exit code
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Force termination
    async fn kill(&self, id: &str) -> Result<()>;

    /// Remove a stopped container
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Runtime backed by a docker-compatible CLI (`docker`, `podman`, ...)
#[derive(Debug, Clone)]
pub struct CliRuntime {
    program: String,
}

impl CliRuntime {
    /// Use `program` as the runtime binary
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Arguments for `run` that create and start `config` detached
    pub fn run_args(config: &ContainerConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            config.name.clone(),
            "--network".into(),
            config.network.clone(),
        ];

        for alias in &config.network_aliases {
            args.push("--network-alias".into());
            args.push(alias.clone());
        }
        for (key, value) in &config.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &config.env {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }
        for port in &config.ports {
            args.push("--publish".into());
            args.push(port.to_publish_arg());
        }
        for mount in &config.mounts {
            args.push("--volume".into());
            args.push(match mount {
                Mount::Volume {
                    name,
                    target,
                    read_only,
                } => volume_arg(name, target, *read_only),
                Mount::Bind {
                    source,
                    target,
                    read_only,
                } => volume_arg(&source.to_string_lossy(), target, *read_only),
                Mount::Anonymous { target } => target.clone(),
            });
        }

        if let Some(wd) = &config.working_dir {
            args.push("--workdir".into());
            args.push(wd.clone());
        }
        if let Some(user) = &config.user {
            args.push("--user".into());
            args.push(user.clone());
        }
        args.push("--stop-signal".into());
        args.push(config.stop_signal.clone());

        if let Some(hc) = &config.healthcheck {
            let cmd = match hc.test.split_first() {
                Some((kind, rest)) if kind == "CMD-SHELL" => rest.join(" "),
                Some((kind, rest)) if kind == "CMD" => shell_join(rest),
                _ => shell_join(&hc.test),
            };
            args.push("--health-cmd".into());
            args.push(cmd);
            if let Some(d) = hc.interval {
                args.push("--health-interval".into());
                args.push(go_duration(d));
            }
            if let Some(d) = hc.timeout {
                args.push("--health-timeout".into());
                args.push(go_duration(d));
            }
            if let Some(d) = hc.start_period {
                args.push("--health-start-period".into());
                args.push(go_duration(d));
            }
            if let Some(r) = hc.retries {
                args.push("--health-retries".into());
                args.push(r.to_string());
            }
        }

        // The CLI takes a single executable for --entrypoint; the rest of
        // the entrypoint goes in front of the command.
        let mut trailing = Vec::new();
        match config.entrypoint.as_deref() {
            Some([]) => {
                args.push("--entrypoint".into());
                args.push(String::new());
            }
            Some([exe, rest @ ..]) => {
                args.push("--entrypoint".into());
                args.push(exe.clone());
                trailing.extend(rest.iter().cloned());
            }
            None => {}
        }

        args.push(config.image.clone());
        args.extend(trailing);
        if let Some(cmd) = &config.command {
            args.extend(cmd.iter().cloned());
        }

        args
    }

    async fn exec(&self, args: &[String]) -> Result<String> {
        tracing::debug!("{} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ComposeError::Runtime(format!("Failed to execute {}: {}", self.program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_failure(&self.program, args, &stderr))
        }
    }

    /// Run, treating "already in the desired state" failures as success
    async fn exec_tolerant(&self, args: &[String], benign: &[&str]) -> Result<()> {
        match self.exec(args).await {
            Ok(_) => Ok(()),
            Err(ComposeError::Runtime(msg)) if benign.iter().any(|b| msg.contains(b)) => {
                tracing::debug!("Ignoring runtime response: {}", msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Map a failed invocation's stderr to an error. The object named by the
/// last argument is reported when the runtime says it does not exist.
fn classify_failure(program: &str, args: &[String], stderr: &str) -> ComposeError {
    let subject = args.last().cloned().unwrap_or_default();
    if stderr.contains("No such container") || stderr.contains("No such object") {
        return ComposeError::ContainerNotFound(subject);
    }
    if args.first().map(|s| s.as_str()) == Some("volume")
        && stderr.to_lowercase().contains("no such volume")
    {
        return ComposeError::VolumeNotFound(subject);
    }
    ComposeError::Runtime(format!(
        "{} {} failed: {}",
        program,
        args.first().map(|s| s.as_str()).unwrap_or_default(),
        stderr
    ))
}

/// Whether a failed `run` may have left a created container behind
fn run_left_container(err: &ComposeError) -> bool {
    match err {
        ComposeError::Runtime(msg) => {
            !msg.contains("is already in use") && !msg.starts_with("Failed to execute")
        }
        _ => false,
    }
}

fn volume_arg(source: &str, target: &str, read_only: bool) -> String {
    if read_only {
        format!("{}:{}:ro", source, target)
    } else {
        format!("{}:{}", source, target)
    }
}

fn go_duration(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

/// Join words into a POSIX shell command line
pub fn shell_join(words: &[String]) -> String {
    words
        .iter()
        .map(|w| {
            let safe = !w.is_empty()
                && w
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
            if safe {
                w.clone()
            } else {
                format!("'{}'", w.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

/// Parse the JSON printed by `inspect --format '{{json .State}}'`
pub fn parse_inspect_state(raw: &str) -> Result<ContainerState> {
    let state: InspectState = serde_json::from_str(raw)?;
    let status = ContainerStatus::parse(&state.status.to_lowercase()).ok_or_else(|| {
        ComposeError::Runtime(format!("Unknown container status '{}'", state.status))
    })?;

    Ok(ContainerState {
        status,
        health: state.health.and_then(|h| HealthStatus::parse(&h.status)),
        exit_code: state.exit_code,
        started_at: state
            .started_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
            .filter(|t| t.timestamp() > 0),
    })
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn create_network(&self, network: &NetworkSpec) -> Result<()> {
        let mut args = vec![
            "network".to_string(),
            "create".to_string(),
            "--driver".to_string(),
            network.driver.clone(),
        ];
        for (key, value) in &network.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(network.name.clone());
        self.exec_tolerant(&args, &["already exists"]).await
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let args = vec!["network".to_string(), "rm".to_string(), name.to_string()];
        self.exec_tolerant(&args, &["not found"]).await
    }

    async fn create_volume(&self, volume: &VolumeSpec) -> Result<()> {
        let mut args = vec![
            "volume".to_string(),
            "create".to_string(),
            "--driver".to_string(),
            volume.driver.clone(),
        ];
        for (key, value) in &volume.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(volume.name.clone());
        self.exec(&args).await.map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let args = vec!["volume".to_string(), "rm".to_string(), name.to_string()];
        self.exec(&args).await.map(|_| ())
    }

    async fn run(&self, config: &ContainerConfig) -> Result<String> {
        match self.exec(&Self::run_args(config)).await {
            Ok(id) => {
                tracing::debug!("Container {} has id {}", config.name, id);
                Ok(id)
            }
            Err(e) => {
                if run_left_container(&e) {
                    let args = vec!["rm".to_string(), "--force".to_string(), config.name.clone()];
                    if let Err(cleanup) = self.exec(&args).await {
                        tracing::debug!("Could not remove {} after failed run: {}", config.name, cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .State}}".to_string(),
            id.to_string(),
        ];
        let raw = self.exec(&args).await?;
        parse_inspect_state(&raw)
    }

    async fn signal_stop(&self, id: &str, signal: &str) -> Result<()> {
        let args = vec![
            "kill".to_string(),
            "--signal".to_string(),
            signal.to_string(),
            id.to_string(),
        ];
        self.exec_tolerant(&args, &["is not running"]).await
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let raw = self.exec(&["wait".to_string(), id.to_string()]).await?;
        raw.lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| ComposeError::Runtime(format!("Unexpected wait output '{}'", raw)))
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let args = vec!["kill".to_string(), id.to_string()];
        self.exec_tolerant(&args, &["is not running"]).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.exec(&["rm".to_string(), id.to_string()]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::topology::{HealthcheckSpec, PortMapping, Protocol};
    use std::path::PathBuf;

    fn api_config() -> ContainerConfig {
        let mut config = ContainerConfig::new("demo-api-1", "api:latest", "demo_default")
            .env("REDIS_URL", "redis://broker:6379/0")
            .label("com.docker.compose.service", "api")
            .mount(Mount::Volume {
                name: "demo_data".into(),
                target: "/data".into(),
                read_only: false,
            })
            .mount(Mount::Bind {
                source: PathBuf::from("/srv/src"),
                target: "/opt/src".into(),
                read_only: true,
            });
        config.network_aliases = vec!["api".into()];
        config.ports.push(PortMapping {
            host_ip: None,
            host_port: Some(8000),
            container_port: 8000,
            protocol: Protocol::Tcp,
        });
        config.entrypoint = Some(vec!["sh".into(), "-c".into(), "exec app".into()]);
        config
    }

    #[test]
    fn test_run_args() {
        let args = CliRuntime::run_args(&api_config());
        let joined = args.join(" ");

        assert_eq!(&args[..6], ["run", "--detach", "--name", "demo-api-1", "--network", "demo_default"]);
        assert!(joined.contains("--network-alias api"));
        assert!(joined.contains("--env REDIS_URL=redis://broker:6379/0"));
        assert!(joined.contains("--publish 8000:8000/tcp"));
        assert!(joined.contains("--volume demo_data:/data"));
        assert!(joined.contains("--volume /srv/src:/opt/src:ro"));
        assert!(joined.contains("--stop-signal SIGTERM"));

        let image = args.iter().position(|a| a == "api:latest").unwrap();
        assert_eq!(args[image - 2..image], ["--entrypoint", "sh"]);
        assert_eq!(args[image + 1..], ["-c", "exec app"]);
    }

    #[test]
    fn test_run_args_healthcheck_and_command() {
        let mut config = ContainerConfig::new("demo-broker-1", "redis:7", "demo_default");
        config.healthcheck = Some(HealthcheckSpec {
            test: vec!["CMD".into(), "redis-cli".into(), "ping".into()],
            interval: Some(Duration::from_secs(5)),
            timeout: None,
            retries: Some(3),
            start_period: None,
        });
        config.command = Some(vec!["redis-server".into(), "--appendonly".into(), "yes".into()]);

        let args = CliRuntime::run_args(&config);
        let joined = args.join(" ");
        assert!(joined.contains("--health-cmd redis-cli ping"));
        assert!(joined.contains("--health-interval 5000ms"));
        assert!(joined.contains("--health-retries 3"));
        assert!(joined.ends_with("redis:7 redis-server --appendonly yes"));
    }

    #[test]
    fn test_shell_join_quotes() {
        let words: Vec<String> = vec!["echo".into(), "it's".into(), "a b".into(), "".into()];
        assert_eq!(shell_join(&words), r#"echo 'it'\''s' 'a b' ''"#);
    }

    #[test]
    fn test_parse_inspect_state() {
        let raw = r#"{"Status":"running","Running":true,"ExitCode":0,
            "StartedAt":"2026-01-02T03:04:05.123456789Z",
            "Health":{"Status":"healthy","FailingStreak":0}}"#;
        let state = parse_inspect_state(raw).unwrap();
        assert_eq!(state.status, ContainerStatus::Running);
        assert_eq!(state.health, Some(HealthStatus::Healthy));
        assert!(state.started_at.is_some());

        let raw = r#"{"Status":"exited","ExitCode":137,"StartedAt":"0001-01-01T00:00:00Z"}"#;
        let state = parse_inspect_state(raw).unwrap();
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.exit_code, Some(137));
        assert_eq!(state.health, None);
        assert_eq!(state.started_at, None);

        assert!(parse_inspect_state(r#"{"Status":"sleepy"}"#).is_err());
    }

    #[test]
    fn test_missing_volume_is_volume_not_found() {
        let args: Vec<String> = vec!["volume".into(), "rm".into(), "demo_data".into()];
        let err = classify_failure(
            "docker",
            &args,
            "Error response from daemon: get demo_data: no such volume",
        );
        assert!(matches!(err, ComposeError::VolumeNotFound(ref v) if v == "demo_data"));

        let err = classify_failure("podman", &args, "Error: No such volume: demo_data");
        assert!(matches!(err, ComposeError::VolumeNotFound(_)));

        let err = classify_failure("docker", &args, "volume is in use - [4f2a]");
        assert!(matches!(err, ComposeError::Runtime(ref m) if m == "docker volume failed: volume is in use - [4f2a]"));

        let args: Vec<String> = vec!["inspect".into(), "4f2a".into()];
        let err = classify_failure("docker", &args, "Error: No such object: 4f2a");
        assert!(matches!(err, ComposeError::ContainerNotFound(ref id) if id == "4f2a"));
    }

    #[test]
    fn test_failed_run_cleanup_decision() {
        let started = ComposeError::Runtime(
            "docker run failed: driver failed programming external connectivity: \
             Bind for 0.0.0.0:8000 failed: port is already allocated"
                .to_string(),
        );
        assert!(run_left_container(&started));

        let conflict = ComposeError::Runtime(
            r#"docker run failed: Conflict. The container name "/demo-api-1" is already in use"#
                .to_string(),
        );
        assert!(!run_left_container(&conflict));

        let missing = ComposeError::Runtime("Failed to execute docker: No such file".to_string());
        assert!(!run_left_container(&missing));
    }
}
