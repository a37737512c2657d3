//! SSH sessions using the russh crate

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::result::{CommandResult, SshTarget};
use crate::shell_quote;
use crate::traits::{RemoteSession, SessionFactory};

/// Bound on TCP connect plus authentication
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Machines are addressed by inventory, host keys are not pinned.
        Ok(true)
    }
}

/// Authenticated SSH session
pub struct SshSession {
    target: SshTarget,
    handle: client::Handle<SshClientHandler>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl SshSession {
    /// Dial `target` and authenticate with the private key at `key_path`
    ///
    /// # Errors
    /// `SshKeyError` when the key cannot be loaded, `Timeout` when the dial plus
    /// authentication exceeds `connect_timeout`.
    #[instrument(skip(key_path), fields(target = %target))]
    pub async fn connect(
        target: &SshTarget,
        key_path: &Path,
        connect_timeout: Duration,
    ) -> Result<Self, ExecError> {
        validate_key_permissions(key_path)?;
        let key =
            load_secret_key(key_path, None).map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        let handle = timeout(connect_timeout, async {
            let config = Arc::new(client::Config::default());
            let addr = (&target.host[..], target.port);
            let mut handle = client::connect(config, addr, SshClientHandler)
                .await
                .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
            let auth = handle
                .authenticate_publickey(&target.user, key)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;
            if !auth.success() {
                return Err(ExecError::AuthenticationFailed(
                    "public key authentication rejected".to_string(),
                ));
            }
            Ok(handle)
        })
        .await
        .map_err(|_| ExecError::Timeout {
            timeout: connect_timeout,
        })??;

        debug!("SSH session established");
        Ok(Self {
            target: target.clone(),
            handle,
        })
    }

    async fn execute(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let start = Instant::now();
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut status = -1;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = exit_status.cast_signed(),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let result = CommandResult {
            status,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            duration: start.elapsed(),
        };
        debug!(command = %cmd, status, duration = ?result.duration, "remote command completed");
        Ok(result)
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    #[instrument(skip(self), fields(target = %self.target))]
    async fn exec(&self, cmd: &str, limit: Duration) -> Result<CommandResult, ExecError> {
        timeout(limit, self.execute(cmd))
            .await
            .map_err(|_| ExecError::Timeout { timeout: limit })?
    }

    #[instrument(skip(self, contents), fields(target = %self.target, bytes = contents.len()))]
    async fn upload(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), ExecError> {
        let failed = |reason: String| ExecError::UploadFailed {
            path: path.to_string(),
            reason,
        };

        // Create the file with its final mode first; the SFTP open truncates but keeps it.
        let quoted = shell_quote(path);
        let prepare = self
            .execute(&format!("umask 077 && : > {quoted} && chmod {mode:o} {quoted}"))
            .await?;
        if !prepare.success() {
            return Err(failed(prepare.stderr.trim().to_string()));
        }

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| failed(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| failed(e.to_string()))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| failed(e.to_string()))?;

        let mut file = sftp.create(path).await.map_err(|e| failed(e.to_string()))?;
        file.write_all(contents)
            .await
            .map_err(|e| failed(e.to_string()))?;
        file.shutdown().await.map_err(|e| failed(e.to_string()))?;
        if let Err(e) = sftp.close().await {
            debug!(error = %e, "SFTP close failed");
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!(target = %self.target, error = %e, "SSH disconnect failed");
        }
    }

    fn session_type(&self) -> &'static str {
        "ssh"
    }
}

/// Opens [`SshSession`]s authenticated with the key at `key_path`
///
/// The key is re-read on every open so a replaced key takes effect without restart.
#[derive(Debug, Clone)]
pub struct SshSessionFactory {
    key_path: PathBuf,
    connect_timeout: Duration,
}

impl SshSessionFactory {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, ExecError> {
        let session = SshSession::connect(target, &self.key_path, self.connect_timeout).await?;
        info!(target = %target, "opened SSH session");
        Ok(Box::new(session))
    }
}

fn validate_key_permissions(path: &Path) -> Result<(), ExecError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| ExecError::SshKeyError(format!("{}: {e}", path.display())))?;
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(ExecError::SshKeyError(format!(
            "key file permissions too open: {} (should be 600)",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_is_key_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = SshTarget::new("127.0.0.1", 22);
        let err = SshSession::connect(&target, &dir.path().join("absent"), DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SshKeyError(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_world_readable_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id");
        std::fs::write(&path, "key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = validate_key_permissions(&path).unwrap_err();
        assert!(err.to_string().contains("too open"));
    }
}
