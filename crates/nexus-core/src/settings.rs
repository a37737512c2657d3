//! Shared settings value object

use std::time::Duration;

use nexus_ca::LeasePolicy;
use serde::{Deserialize, Serialize};

/// sshd configuration fragment delivered to every machine unless overridden
pub const DEFAULT_SSH_CONFIG: &str = "PubkeyAuthentication yes
PermitRootLogin yes
PermitEmptyPasswords no
PasswordAuthentication no
TrustedUserCAKeys /etc/ssh/nexus_user.pub
HostKey /etc/ssh/ssh_host_ed25519_key
HostCertificate /etc/ssh/ssh_host_ed25519_key-cert.pub
AuthorizedPrincipalsFile /etc/ssh/nexus_principals/%u
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ssh_config: String,
    /// Default user certificate lease, seconds
    pub user_lease: u64,
    /// Default host certificate lease, seconds
    pub host_lease: u64,
    /// Upper bound for any lease, seconds
    pub max_lease: u64,
    /// Install the agent on newly added machines
    pub install_agent: bool,
    /// Control endpoint as agents reach it
    pub external_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_config: DEFAULT_SSH_CONFIG.to_string(),
            user_lease: 24 * 3600,
            host_lease: 30 * 24 * 3600,
            max_lease: 90 * 24 * 3600,
            install_agent: true,
            external_url: None,
        }
    }
}

impl Settings {
    pub fn user_policy(&self) -> LeasePolicy {
        LeasePolicy::new(
            Duration::from_secs(self.user_lease),
            Duration::from_secs(self.max_lease),
        )
    }

    pub fn host_policy(&self) -> LeasePolicy {
        LeasePolicy::new(
            Duration::from_secs(self.host_lease),
            Duration::from_secs(self.max_lease),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_policy_is_thirty_days() {
        let settings = Settings::default();
        assert_eq!(
            settings.host_policy().lease(None),
            Duration::from_secs(2_592_000)
        );
    }

    #[test]
    fn test_partial_settings_keep_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"user_lease": 60}"#).unwrap();
        assert_eq!(settings.user_lease, 60);
        assert!(settings.install_agent);
        assert!(settings.ssh_config.contains("TrustedUserCAKeys"));
    }
}
