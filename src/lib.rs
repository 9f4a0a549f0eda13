//! rune-compose - launch a compose project on a docker-compatible runtime
//!
//! rune-compose reads a compose file and drives a container runtime to
//! bring the project up and down:
//!
//! - Dependency ordering with `service_started` / `service_healthy` waits
//! - Variable interpolation with defaults, resolved at launch
//! - Reference-counted named volumes and project network
//! - Grace-period shutdown in reverse dependency order

pub mod compose;
pub mod config;
pub mod container;
pub mod error;
pub mod network;
pub mod storage;

pub use error::{ComposeError, Result};
