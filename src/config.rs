//! Launcher configuration

use std::path::PathBuf;
use std::time::Duration;

/// Default runtime binary
pub const DEFAULT_RUNTIME: &str = "docker";

/// Default bound on waiting for a container to become ready
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default readiness polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Launcher configuration
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Runtime binary (`docker`, `podman`, ...)
    pub runtime: String,
    /// Where project state is persisted; `None` keeps it in memory
    pub state_dir: Option<PathBuf>,
    /// Bound on each readiness wait
    pub ready_timeout: Duration,
    /// Interval between readiness polls
    pub poll_interval: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            runtime: DEFAULT_RUNTIME.to_string(),
            state_dir: Some(default_state_dir()),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl LauncherConfig {
    /// Configuration that persists nothing
    pub fn ephemeral() -> Self {
        Self {
            state_dir: None,
            ..Self::default()
        }
    }
}

/// `<data dir>/rune-compose`
pub fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("rune-compose")
}
