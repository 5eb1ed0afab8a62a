//! Error types for configuration persistence and the VPN service.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to persist the generated proxy configuration.
///
/// These are the only faults that escape the VPN service, since the proxy
/// binary cannot start without its configuration on disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Writing the configuration file failed.
    #[error("failed to write proxy config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serializing the configuration failed.
    #[error("failed to serialize proxy config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A generated document that does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("proxy config schema violation at {path}: {message}")]
pub struct SchemaViolation {
    /// JSON path of the offending value.
    pub path: String,
    /// What was wrong with it.
    pub message: String,
}

impl SchemaViolation {
    pub(crate) fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Service error type.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Proxy configuration could not be persisted.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The background startup task went away without reporting.
    #[error("VPN startup task ended without a result")]
    TaskLost,
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
