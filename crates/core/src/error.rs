//! Core error types

use thiserror::Error;

use crate::audit::AuditError;
use crate::config::ConfigError;

/// Core error type for the kill-switch control plane
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Audit log append or integrity failure
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias over the core [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
