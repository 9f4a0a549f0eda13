//! Error types for rune-compose

use thiserror::Error;

/// Result type for rune-compose operations
pub type Result<T> = std::result::Result<T, ComposeError>;

/// rune-compose error types
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Compose file parse error: {0}")]
    Parse(String),

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Service {service} failed to start: {reason}")]
    StartFailure { service: String, reason: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComposeError {
    /// Shorthand for a start failure of `service`
    pub fn start_failure(service: &str, reason: impl Into<String>) -> Self {
        ComposeError::StartFailure {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error aborts a load before anything runs
    pub fn is_fatal_load_error(&self) -> bool {
        matches!(self, ComposeError::Parse(_) | ComposeError::Cycle(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = ComposeError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        assert!(err.is_fatal_load_error());
    }

    #[test]
    fn test_start_failure_is_not_fatal_load_error() {
        let err = ComposeError::start_failure("api", "image missing");
        assert_eq!(err.to_string(), "Service api failed to start: image missing");
        assert!(!err.is_fatal_load_error());
    }
}
