//! Core error types for nexus-core

use thiserror::Error;

/// Errors that can occur in reconciliation and convergence
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// Record store failure
    #[error("store error: {0}")]
    Store(String),

    /// Signing or key material failure
    #[error("certificate authority error: {0}")]
    Ca(String),

    /// SSH execution failed
    #[error("remote execution failed: {0}")]
    Exec(String),

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<nexus_exec::ExecError> for CoreError {
    fn from(e: nexus_exec::ExecError) -> Self {
        CoreError::Exec(e.to_string())
    }
}

impl From<nexus_ca::CaError> for CoreError {
    fn from(e: nexus_ca::CaError) -> Self {
        CoreError::Ca(e.to_string())
    }
}
