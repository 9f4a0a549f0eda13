//! Compose file handling and project orchestration
//!
//! Files are parsed into [`ComposeConfig`], resolved into a validated
//! [`Topology`] and brought up and down by a [`Launcher`].

pub mod config;
pub mod interpolate;
pub mod orchestrator;
pub mod parser;
pub mod state;
pub mod topology;

pub use config::{ComposeConfig, ServiceConfig};
pub use interpolate::Environment;
pub use orchestrator::{
    DownReport, Launcher, ServiceOutcome, ServiceStatus, StopOutcome, UpReport,
};
pub use parser::{ComposeParser, TopologyLoader};
pub use state::{ProjectState, ServiceRecord, ServiceState, StateStore};
pub use topology::{ServiceSpec, Topology};
