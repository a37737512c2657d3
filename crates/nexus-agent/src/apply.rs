//! Apply control-plane pushes to the local filesystem
//!
//! Each field of a [`StreamResponse`] is applied on its own and every write is idempotent,
//! so a repeated push converges to the same files.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nexus_api::{Principal, StreamResponse, paths};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{AgentError, Result};
use crate::paths::AgentPaths;

const ROOT_LOGIN: &str = "root";
const FILE_MODE: u32 = 0o600;

/// What the connection loop should do after a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Continue,
    /// Managed state was removed; the agent should exit
    Terminate,
}

#[derive(Debug, Clone)]
pub struct Applier {
    paths: AgentPaths,
}

impl Applier {
    pub fn new(paths: AgentPaths) -> Self {
        Self { paths }
    }

    /// Apply every field present in `response`
    ///
    /// A field that fails does not stop the others; the failures are returned together
    /// as [`AgentError::Apply`]. Restore is best effort and always terminates.
    #[instrument(skip_all)]
    pub async fn apply(&self, response: &StreamResponse) -> Result<Applied> {
        if response.is_restore() {
            if let Err(e) = self.restore().await {
                warn!(error = %e, "restore incomplete");
            }
            return Ok(Applied::Terminate);
        }

        let mut failures = Vec::new();
        let mut reload = false;
        if let Some(config) = &response.ssh_config {
            match write_file(&self.paths.ssh_config(), config, FILE_MODE).await {
                Ok(()) => {
                    info!("ssh config updated");
                    reload = true;
                }
                Err(e) => failures.push(e),
            }
        }
        if let Some(key) = &response.user_certificate_authority_public_key {
            match self.write_user_ca(key).await {
                Ok(()) => info!("user CA key updated"),
                Err(e) => failures.push(e),
            }
        }
        if let Some(cert) = &response.host_certificate_public_key {
            match write_file(&self.paths.host_certificate(), cert, FILE_MODE).await {
                Ok(()) => {
                    info!("host certificate updated");
                    reload = true;
                }
                Err(e) => failures.push(e),
            }
        }
        if !response.principals.is_empty()
            && let Err(e) = self.write_principals(&response.principals).await
        {
            failures.push(e);
        }

        if reload {
            self.reload_sshd().await;
        }
        if failures.is_empty() {
            Ok(Applied::Continue)
        } else {
            Err(AgentError::Apply(failures))
        }
    }

    async fn write_user_ca(&self, key: &[u8]) -> Result<()> {
        write_file(&self.paths.user_ca_public_key(), key, FILE_MODE).await?;
        authorize_key(&self.paths.root_authorized_keys(), key).await
    }

    /// Make the principal directory hold exactly one file per login name
    async fn write_principals(&self, principals: &[Principal]) -> Result<()> {
        let desired = with_root(principals);
        let dir = self.paths.principals_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::io(&dir, e))?;

        for (login, values) in &desired {
            let mut contents = values.join("\n");
            contents.push('\n');
            write_file(&dir.join(login), contents.as_bytes(), FILE_MODE).await?;
        }

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| AgentError::io(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| AgentError::io(&dir, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !desired.contains_key(&name) {
                debug!(login = %name, "removing stale principal file");
                remove_path(&entry.path()).await?;
            }
        }
        info!(logins = desired.len(), "principals updated");
        Ok(())
    }

    /// Remove every managed file and take the agent service down
    pub async fn restore(&self) -> Result<()> {
        warn!("restore requested, removing managed files");
        let mut failures = Vec::new();
        for path in self.paths.managed() {
            if let Err(e) = remove_path(&path).await {
                failures.push(e);
            }
        }
        if self.paths.is_system() {
            let service = paths::AGENT_SERVICE_NAME;
            for args in [
                vec!["disable", service],
                vec!["daemon-reload"],
                vec!["stop", "--no-block", service],
            ] {
                systemctl(&args).await;
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Apply(failures))
        }
    }

    async fn reload_sshd(&self) {
        if !self.paths.is_system() {
            return;
        }
        if !systemctl(&["reload", "ssh"]).await {
            systemctl(&["reload", "sshd"]).await;
        }
    }
}

/// Merge duplicate keys and put the literal `root` first in the root entry
fn with_root(principals: &[Principal]) -> BTreeMap<String, Vec<String>> {
    let mut desired: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for principal in principals {
        let values = desired.entry(principal.key.clone()).or_default();
        for value in &principal.values {
            if !values.contains(value) {
                values.push(value.clone());
            }
        }
    }
    let root = desired.entry(ROOT_LOGIN.to_string()).or_default();
    root.retain(|v| v != ROOT_LOGIN);
    root.insert(0, ROOT_LOGIN.to_string());
    desired
}

/// Append `key` to `authorized_keys` unless an identical line is present
async fn authorize_key(authorized_keys: &Path, key: &[u8]) -> Result<()> {
    let key = String::from_utf8_lossy(key).trim().to_string();
    if key.is_empty() {
        return Ok(());
    }
    let existing = match tokio::fs::read_to_string(authorized_keys).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(AgentError::io(authorized_keys, e)),
    };
    let lines: BTreeSet<&str> = existing.lines().map(str::trim).collect();
    if lines.contains(key.as_str()) {
        return Ok(());
    }

    let mut contents = existing.clone();
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&key);
    contents.push('\n');
    write_file(authorized_keys, contents.as_bytes(), FILE_MODE).await
}

pub(crate) async fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentError::io(parent, e))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| AgentError::io(path, e))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| AgentError::io(path, e))
}

async fn remove_path(path: &Path) -> Result<()> {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| AgentError::io(path, e))
}

/// Run `systemctl`; failures are logged only
async fn systemctl(args: &[&str]) -> bool {
    match Command::new("systemctl").args(args).status().await {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(?args, %status, "systemctl failed");
            false
        }
        Err(e) => {
            warn!(?args, error = %e, "systemctl unavailable");
            false
        }
    }
}
