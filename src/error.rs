//! Error handling module for the installer
//!
//! Every failure the engine can hit maps onto one variant here. The variant
//! decides how the workflow reacts: configuration and engine errors are fatal,
//! probe errors are absorbed with a warning, connectivity errors go back to
//! the operator as a retry/exit question, and subprocess errors halt the
//! supervised install.

use thiserror::Error;

/// Main error type for the installer
#[derive(Error, Debug)]
pub enum InstallerError {
    /// IO errors (file operations, process spawning, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP errors from the release metadata source
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing or invalid required input
    #[error("Configuration error: {0}")]
    Config(String),

    /// System-status, runtime or release probes that could not answer
    #[error("Probe failed: {0}")]
    Probe(String),

    /// Database connectivity failures reported by the connection probe
    #[error("Connection failed: {0}")]
    Connectivity(String),

    /// External subprocess exited abnormally or was classified as failed
    #[error("Subprocess failed: {0}")]
    Subprocess(String),

    /// Unrecoverable workflow errors (working directory, entry points)
    #[error("Engine error: {0}")]
    Engine(String),

    /// The cancellation token fired while waiting
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallerError>;

// Convenient error constructors
impl InstallerError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a connectivity error
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    /// Create a subprocess error
    pub fn subprocess(msg: impl Into<String>) -> Self {
        Self::Subprocess(msg.into())
    }

    /// Create a fatal engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Whether the workflow may continue after this error
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Probe(_) | Self::Connectivity(_))
    }
}
