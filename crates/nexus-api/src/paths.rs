//! Fixed locations on managed machines
//!
//! Written by the agent when connected and by the control plane over SSH otherwise, so
//! both halves must agree on them.

pub const SSH_CONFIG: &str = "/etc/ssh/sshd_config.d/nexus.conf";
pub const PRINCIPALS_DIR: &str = "/etc/ssh/nexus_principals";
pub const USER_CA_PUBLIC_KEY: &str = "/etc/ssh/nexus_user.pub";

pub const HOST_KEY: &str = "/etc/ssh/ssh_host_ed25519_key";
pub const HOST_PUBLIC_KEY: &str = "/etc/ssh/ssh_host_ed25519_key.pub";
pub const HOST_CERTIFICATE: &str = "/etc/ssh/ssh_host_ed25519_key-cert.pub";

/// Root's authorized_keys; carries the user CA key so the control plane can log in over SSH
pub const ROOT_AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";

pub const AGENT_BINARY: &str = "/usr/local/bin/nexus-agent";
pub const AGENT_SERVICE_NAME: &str = "nexus-agent.service";
pub const AGENT_SERVICE_UNIT: &str = "/etc/systemd/system/nexus-agent.service";
pub const AGENT_STATE_DIR: &str = "/etc/nexus-agent";
pub const AGENT_TOKEN: &str = "/etc/nexus-agent/token";
/// Random identity kept when `/etc/machine-id` is unavailable
pub const AGENT_ID: &str = "/etc/nexus-agent/id";
pub const MACHINE_ID: &str = "/etc/machine-id";

/// Principal file of a login name
#[must_use]
pub fn principal_file(login: &str) -> String {
    format!("{PRINCIPALS_DIR}/{login}")
}

