//! Container management module
//!
//! This module describes the containers a service runs in and the runtime
//! seam that creates, signals and removes them.

pub mod config;
pub mod lifecycle;
pub mod runtime;

pub use config::{ContainerConfig, ContainerState, ContainerStatus, HealthStatus, Mount};
pub use lifecycle::{MemoryRuntime, RuntimeEvent, KILLED_EXIT_CODE};
pub use runtime::{CliRuntime, ContainerRuntime};
