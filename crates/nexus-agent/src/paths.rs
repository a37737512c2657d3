//! Managed file locations, optionally rebased under a root directory

use std::path::PathBuf;

use nexus_api::paths;

#[derive(Debug, Clone, Default)]
pub struct AgentPaths {
    root: Option<PathBuf>,
}

impl AgentPaths {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// Whether paths point at the live system rather than a rebased tree
    pub fn is_system(&self) -> bool {
        self.root.is_none()
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }

    pub fn ssh_config(&self) -> PathBuf {
        self.resolve(paths::SSH_CONFIG)
    }

    pub fn principals_dir(&self) -> PathBuf {
        self.resolve(paths::PRINCIPALS_DIR)
    }

    pub fn user_ca_public_key(&self) -> PathBuf {
        self.resolve(paths::USER_CA_PUBLIC_KEY)
    }

    pub fn host_key(&self) -> PathBuf {
        self.resolve(paths::HOST_KEY)
    }

    pub fn host_public_key(&self) -> PathBuf {
        self.resolve(paths::HOST_PUBLIC_KEY)
    }

    pub fn host_certificate(&self) -> PathBuf {
        self.resolve(paths::HOST_CERTIFICATE)
    }

    pub fn root_authorized_keys(&self) -> PathBuf {
        self.resolve(paths::ROOT_AUTHORIZED_KEYS)
    }

    pub fn token(&self) -> PathBuf {
        self.resolve(paths::AGENT_TOKEN)
    }

    pub fn agent_id(&self) -> PathBuf {
        self.resolve(paths::AGENT_ID)
    }

    pub fn machine_id(&self) -> PathBuf {
        self.resolve(paths::MACHINE_ID)
    }

    /// Everything a restore removes
    pub fn managed(&self) -> Vec<PathBuf> {
        [
            paths::PRINCIPALS_DIR,
            paths::SSH_CONFIG,
            paths::USER_CA_PUBLIC_KEY,
            paths::HOST_CERTIFICATE,
            paths::AGENT_BINARY,
            paths::AGENT_SERVICE_UNIT,
            paths::AGENT_TOKEN,
        ]
        .into_iter()
        .map(|p| self.resolve(p))
        .collect()
    }
}
