//! Local sessions using `tokio::process`
//!
//! Runs commands on this machine and writes uploads beneath an optional root directory.
//! Used by the daemon for machines addressed as `local` and by tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, instrument};

use crate::error::ExecError;
use crate::result::{CommandResult, SshTarget};
use crate::traits::{RemoteSession, SessionFactory};

#[derive(Debug, Clone, Default)]
pub struct LocalSession {
    root: Option<PathBuf>,
}

impl LocalSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebase uploaded paths under `root`
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn execute(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).kill_on_drop(true);
        if let Some(root) = &self.root {
            command.current_dir(root);
        }
        let output = command
            .output()
            .await
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            error!(command = %cmd, status, stderr = %stderr, "command failed");
        }

        Ok(CommandResult {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            duration: start.elapsed(),
        })
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn exec(&self, cmd: &str, limit: Duration) -> Result<CommandResult, ExecError> {
        timeout(limit, self.execute(cmd))
            .await
            .map_err(|_| ExecError::Timeout { timeout: limit })?
    }

    async fn upload(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), ExecError> {
        let target = self.resolve(path);
        write_with_mode(&target, contents, mode)
            .await
            .map_err(|e| ExecError::UploadFailed {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        debug!(path = %target.display(), "wrote file");
        Ok(())
    }

    async fn close(&self) {}

    fn session_type(&self) -> &'static str {
        "local"
    }
}

async fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

/// Hands out [`LocalSession`]s regardless of target
#[derive(Debug, Clone, Default)]
pub struct LocalSessionFactory {
    session: LocalSession,
}

impl LocalSessionFactory {
    pub fn new(session: LocalSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SessionFactory for LocalSessionFactory {
    async fn open(&self, _target: &SshTarget) -> Result<Box<dyn RemoteSession>, ExecError> {
        Ok(Box::new(self.session.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_exec_success() {
        let result = LocalSession::new().exec("echo hello", LIMIT).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_exec_failure_status() {
        let result = LocalSession::new().exec("exit 42", LIMIT).await.unwrap();
        assert!(!result.success());
        assert_eq!(result.status, 42);
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let result = LocalSession::new()
            .exec("sleep 5", Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_upload_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let session = LocalSession::with_root(dir.path());
        session
            .upload("/etc/ssh/nexus_principals/deploy", b"abc-123\n", 0o644)
            .await
            .unwrap();

        let path = dir.path().join("etc/ssh/nexus_principals/deploy");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abc-123\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[tokio::test]
    async fn test_commands_run_in_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let result = LocalSession::with_root(dir.path())
            .exec("ls", LIMIT)
            .await
            .unwrap();
        assert_eq!(result.stdout_lines().collect::<Vec<_>>(), ["marker"]);
    }
}
