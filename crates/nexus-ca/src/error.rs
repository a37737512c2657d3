//! Error types for nexus-ca

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by signing, key management and TLS identity operations
#[derive(Error, Debug)]
pub enum CaError {
    /// Requested lease is zero or below one second
    #[error("invalid expiration time")]
    InvalidTtl,

    /// Subject public key could not be parsed
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Imported private key could not be parsed
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// On-disk key material is missing or unreadable
    #[error("key material unavailable at {path}: {reason}")]
    KeyMaterial {
        /// File that failed
        path: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// Certificate construction or signing failed
    #[error("signing failed: {0}")]
    Signing(String),

    /// TLS certificate generation or loading failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// ACME provisioning failed
    #[error("ACME error: {0}")]
    Acme(String),

    /// Control endpoint is neither an IP address nor a valid domain
    #[error("invalid host: {0}")]
    InvalidHost(String),

    /// Token file is empty or missing
    #[error("token not found")]
    TokenNotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaError {
    pub(crate) fn key_material(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CaError::KeyMaterial {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller sent a bad request (as opposed to a local failure)
    #[must_use]
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            CaError::InvalidTtl | CaError::InvalidPublicKey(_) | CaError::InvalidPrivateKey(_)
        )
    }
}

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        CaError::Tls(e.to_string())
    }
}

impl From<rustls::Error> for CaError {
    fn from(e: rustls::Error) -> Self {
        CaError::Tls(e.to_string())
    }
}
