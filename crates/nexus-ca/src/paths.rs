//! On-disk layout of the control plane's key material

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// File locations rooted at the daemon's data directory
#[derive(Debug, Clone)]
pub struct CaPaths {
    root: PathBuf,
}

impl CaPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// User CA private key; also the SSH client identity used to reach machines as root
    pub fn user_ca_key(&self) -> PathBuf {
        self.root.join("nexus_user.key")
    }

    pub fn host_ca_key(&self) -> PathBuf {
        self.root.join("nexus_host_ca.key")
    }

    pub fn token(&self) -> PathBuf {
        self.root.join("token")
    }

    /// Token that stays valid until the fleet has been moved to its successor
    pub fn previous_token(&self) -> PathBuf {
        self.root.join("token.previous")
    }

    /// Bearer token for the admin API when none is configured
    pub fn admin_token(&self) -> PathBuf {
        self.root.join("admin_token")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    pub fn server_ca_cert(&self) -> PathBuf {
        self.certs_dir().join("proto_server_ca.pem")
    }

    pub fn server_ca_key(&self) -> PathBuf {
        self.certs_dir().join("proto_server_ca.key")
    }

    pub fn server_cert(&self) -> PathBuf {
        self.certs_dir().join("proto_server.pem")
    }

    pub fn server_key(&self) -> PathBuf {
        self.certs_dir().join("proto_server.key")
    }

    /// Records the hostname the current leaf was issued for
    pub fn server_host_marker(&self) -> PathBuf {
        self.certs_dir().join("proto_server.host")
    }

    pub fn acme_dir(&self) -> PathBuf {
        self.certs_dir().join("acme")
    }
}

/// Write `contents` to `path` readable only by the owner, creating parent directories
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Write a world-readable file, creating parent directories
pub(crate) fn write_public(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)
}

/// Remove a file, treating absence as success
pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
