//! Session factory routing machines to a local or SSH session

use std::path::PathBuf;

use async_trait::async_trait;
use nexus_exec::{
    ExecError, LocalSession, RemoteSession, SessionFactory, SshSessionFactory, SshTarget,
};

/// Opens a [`LocalSession`] for loopback targets and an SSH session for everything else
///
/// SSH sessions authenticate as `root` with the user CA key, which every managed machine
/// trusts through its authorized keys.
pub struct RoutingSessionFactory {
    local: LocalSession,
    ssh: SshSessionFactory,
}

impl RoutingSessionFactory {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            local: LocalSession::new(),
            ssh: SshSessionFactory::new(key_path),
        }
    }
}

/// Whether `target` is the daemon's own host
fn is_local(target: &SshTarget) -> bool {
    matches!(target.host.as_str(), "localhost" | "127.0.0.1" | "::1")
}

#[async_trait]
impl SessionFactory for RoutingSessionFactory {
    async fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, ExecError> {
        if is_local(target) {
            tracing::debug!(target = %target, "using local session");
            return Ok(Box::new(self.local.clone()));
        }
        self.ssh.open(target).await
    }
}
