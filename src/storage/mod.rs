//! Storage management module
//!
//! This module tracks the named volumes a project mounts.

pub mod volume;

pub use volume::{Acquisition, Volume, VolumeManager};
