//! Network management module
//!
//! This module tracks the shared project network.

pub mod config;

pub use config::{Network, NetworkDriver, NetworkManager, Release};
