//! rune-compose - compose project launcher
//!
//! This is the main CLI entry point for rune-compose.

use clap::{Parser, Subcommand};
use rune_compose::compose::parser::parse_duration;
use rune_compose::compose::{
    ComposeParser, DownReport, Environment, Launcher, ServiceOutcome, TopologyLoader, UpReport,
};
use rune_compose::config::{default_state_dir, LauncherConfig, DEFAULT_RUNTIME};
use rune_compose::container::{CliRuntime, ContainerRuntime, MemoryRuntime};
use rune_compose::error::{ComposeError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// rune-compose - launch compose projects
#[derive(Parser)]
#[command(name = "rune-compose")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Launch a compose project on a docker-compatible runtime", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Compose file (repeatable; later files override earlier ones)
    #[arg(short = 'f', long = "file", global = true, env = "COMPOSE_FILE", value_delimiter = ':')]
    files: Vec<PathBuf>,

    /// Project name
    #[arg(short = 'p', long, global = true, env = "COMPOSE_PROJECT_NAME")]
    project_name: Option<String>,

    /// Runtime binary
    #[arg(long, global = true, env = "RUNE_COMPOSE_RUNTIME", default_value = DEFAULT_RUNTIME)]
    runtime: String,

    /// Directory for persisted project state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// How long to wait for each service to become ready (e.g. 60s, 2m)
    #[arg(long, global = true, default_value = "60s", value_parser = duration_arg)]
    ready_timeout: Duration,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start the project
    Up {
        /// Run in detached mode
        #[arg(short, long)]
        detach: bool,
        /// Plan against an in-memory runtime without touching containers
        #[arg(long)]
        dry_run: bool,
    },

    /// Stop and remove the project
    Down {
        /// Remove named volumes
        #[arg(short, long)]
        volumes: bool,
    },

    /// List services
    Ps {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate and print the merged compose file
    Config,
}

fn duration_arg(raw: &str) -> std::result::Result<Duration, String> {
    parse_duration(raw).map_err(|e| e.to_string())
}

/// Explicit files, or the first default file in `cwd`
fn compose_files(files: &[PathBuf], cwd: &Path) -> Result<Vec<PathBuf>> {
    if !files.is_empty() {
        return Ok(files.iter().map(|f| cwd.join(f)).collect());
    }

    ComposeParser::find_compose_file(cwd)
        .map(|f| vec![f])
        .ok_or_else(|| {
            ComposeError::InvalidConfig(format!("No compose file found in {}", cwd.display()))
        })
}

fn print_up(report: &UpReport) {
    for (service, outcome) in &report.services {
        println!("{:<16} {}", service, outcome);
    }
}

fn print_down(report: &DownReport) {
    for (service, outcome) in &report.services {
        println!("{:<16} {}", service, outcome);
    }
    for network in &report.networks_removed {
        println!("Removed network {}", network);
    }
    for volume in &report.volumes_removed {
        println!("Removed volume {}", volume);
    }
}

fn first_failure(report: &UpReport) -> Option<ComposeError> {
    report.services.iter().find_map(|(service, outcome)| match outcome {
        ServiceOutcome::Running => None,
        ServiceOutcome::Failed(reason) => Some(ComposeError::start_failure(service, reason.clone())),
        ServiceOutcome::Skipped(dep) => Some(ComposeError::start_failure(
            service,
            format!("dependency {} is not ready", dep),
        )),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cwd = std::env::current_dir()?;
    let files = compose_files(&cli.files, &cwd)?;
    let working_dir = files
        .first()
        .and_then(|f| f.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.clone());

    let environment = Environment::for_project_dir(&working_dir)?;
    let loader = TopologyLoader::new(working_dir, environment.clone()).project_name(cli.project_name);

    let mut config = LauncherConfig {
        runtime: cli.runtime,
        state_dir: Some(cli.state_dir.unwrap_or_else(default_state_dir)),
        ready_timeout: cli.ready_timeout,
        ..LauncherConfig::default()
    };

    match cli.command {
        Commands::Config => {
            let merged = ComposeParser::parse_files(&files)?;
            for warning in ComposeParser::validate(&merged) {
                println!("Warning: {}", warning);
            }
            loader.resolve(&merged)?;

            let yaml = serde_yaml::to_string(&merged)
                .map_err(|e| ComposeError::Parse(format!("Failed to render YAML: {}", e)))?;
            println!("{}", yaml);
        }

        Commands::Up { detach, dry_run } => {
            let topology = loader.load_files(&files)?;

            if dry_run {
                config.state_dir = None;
                let runtime = Arc::new(MemoryRuntime::new());
                let launcher = Launcher::new(topology, runtime.clone(), environment, &config)?;
                let report = launcher.up().await?;
                for event in runtime.events() {
                    println!("{:?}", event);
                }
                print_up(&report);
                return Ok(());
            }

            let runtime: Arc<dyn ContainerRuntime> = Arc::new(CliRuntime::new(&config.runtime));
            let launcher = Launcher::new(topology, runtime, environment, &config)?;
            let report = launcher.up().await?;
            print_up(&report);

            if let Some(err) = first_failure(&report) {
                if !detach {
                    print_down(&launcher.down(false).await?);
                }
                return Err(err);
            }

            if !detach {
                println!("Press Ctrl-C to stop {}", launcher.topology().project);
                tokio::signal::ctrl_c().await?;
                tracing::info!("Received interrupt, stopping");
                print_down(&launcher.down(false).await?);
            }
        }

        Commands::Down { volumes } => {
            let topology = loader.load_files(&files)?;
            let runtime: Arc<dyn ContainerRuntime> = Arc::new(CliRuntime::new(&config.runtime));
            let launcher = Launcher::new(topology, runtime, environment, &config)?;
            print_down(&launcher.down(volumes).await?);
        }

        Commands::Ps { json } => {
            let topology = loader.load_files(&files)?;
            let runtime: Arc<dyn ContainerRuntime> = Arc::new(CliRuntime::new(&config.runtime));
            let launcher = Launcher::new(topology, runtime, environment, &config)?;
            let statuses = launcher.status().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                println!(
                    "{:<24} {:<12} {:<10} {:<10} {:<10}",
                    "NAME", "SERVICE", "STATE", "STATUS", "HEALTH"
                );
                for status in statuses {
                    println!(
                        "{:<24} {:<12} {:<10} {:<10} {:<10}",
                        status.container_name,
                        status.service,
                        status.state,
                        status
                            .runtime_status
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        status
                            .health
                            .map(|h| format!("{:?}", h).to_lowercase())
                            .unwrap_or_else(|| "-".to_string()),
                    );
                }
            }
        }
    }

    Ok(())
}
