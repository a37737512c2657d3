//! Machine identity, hostname, bearer token and host key

use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::info;

use crate::apply::write_file;
use crate::error::{AgentError, Result};
use crate::paths::AgentPaths;

/// Stable identity of this machine
///
/// `/etc/machine-id` when present, otherwise a random id persisted on first use.
pub async fn machine_id(paths: &AgentPaths) -> Result<String> {
    if let Some(id) = read_trimmed(&paths.machine_id()).await {
        return Ok(id);
    }
    if let Some(id) = read_trimmed(&paths.agent_id()).await {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    write_file(&paths.agent_id(), id.as_bytes(), 0o600)
        .await
        .map_err(|e| AgentError::Credential {
            path: paths.agent_id().display().to_string(),
            reason: e.to_string(),
        })?;
    info!(agent_id = %id, "generated agent identity");
    Ok(id)
}

pub async fn hostname() -> String {
    match read_trimmed(std::path::Path::new("/proc/sys/kernel/hostname")).await {
        Some(name) => name,
        None => std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
    }
}

/// Bearer token installed next to the agent; a missing token is fatal
pub async fn token(paths: &AgentPaths) -> Result<String> {
    let path = paths.token();
    read_trimmed(&path).await.ok_or_else(|| AgentError::Credential {
        path: path.display().to_string(),
        reason: "missing or empty".to_string(),
    })
}

/// Public half of the Ed25519 host key, generating the pair when absent
pub async fn ensure_host_key(paths: &AgentPaths) -> Result<String> {
    if let Some(public) = read_trimmed(&paths.host_public_key()).await {
        if paths.host_key().exists() {
            return Ok(public);
        }
    }

    let mut key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| AgentError::HostKey(e.to_string()))?;
    key.set_comment(hostname().await);
    let private = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| AgentError::HostKey(e.to_string()))?;
    let public = key
        .public_key()
        .to_openssh()
        .map_err(|e| AgentError::HostKey(e.to_string()))?;

    write_file(&paths.host_key(), private.as_bytes(), 0o600).await?;
    write_file(&paths.host_public_key(), format!("{public}\n").as_bytes(), 0o644).await?;
    info!(path = %paths.host_key().display(), "generated host key");
    Ok(public)
}

async fn read_trimmed(path: &std::path::Path) -> Option<String> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let trimmed = contents.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> (AgentPaths, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (AgentPaths::new(Some(dir.path().to_path_buf())), dir)
    }

    #[tokio::test]
    async fn test_machine_id_prefers_system_id() {
        let (paths, _dir) = paths();
        write_file(&paths.machine_id(), b"0123456789abcdef\n", 0o644).await.unwrap();
        assert_eq!(machine_id(&paths).await.unwrap(), "0123456789abcdef");
    }

    #[tokio::test]
    async fn test_generated_id_is_persisted() {
        let (paths, _dir) = paths();
        let first = machine_id(&paths).await.unwrap();
        let second = machine_id(&paths).await.unwrap();
        assert_eq!(first, second);
        assert!(paths.agent_id().exists());
    }

    #[tokio::test]
    async fn test_missing_token_is_fatal() {
        let (paths, _dir) = paths();
        let err = token(&paths).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_host_key_generated_once() {
        let (paths, _dir) = paths();
        let first = ensure_host_key(&paths).await.unwrap();
        assert!(first.starts_with("ssh-ed25519 "));
        assert_eq!(ensure_host_key(&paths).await.unwrap(), first);

        let mode = std::fs::metadata(paths.host_key()).unwrap().permissions();
        assert_eq!(std::os::unix::fs::PermissionsExt::mode(&mode) & 0o777, 0o600);
    }
}
