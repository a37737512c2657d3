//! Error types for the agent

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Bootstrap request for the control-plane root failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection closed by the server
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Local credential material is missing or unreadable
    #[error("credential {path}: {reason}")]
    Credential { path: String, reason: String },

    #[error("host key error: {0}")]
    HostKey(String),

    /// Some fields of a push could not be applied
    #[error("failed to apply push: {}", join(.0))]
    Apply(Vec<AgentError>),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl AgentError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        AgentError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Errors that end the agent instead of triggering a reconnect
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Credential { .. } | AgentError::HostKey(_))
    }
}

fn join(errors: &[AgentError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

pub type Result<T> = std::result::Result<T, AgentError>;
