//! Request types for the admin API

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Sign a user public key
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SignUserRequest {
    /// Public key in authorized-keys format
    pub public_key: String,
    /// User whose principal is embedded; `None` signs for `root`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Requested lease in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// Sign a host public key
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SignHostRequest {
    pub public_key: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// Replace the user CA private key
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SetUserCaRequest {
    /// OpenSSH private key PEM
    pub key: String,
}

/// Create or replace a machine record
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MachineRequest {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_port() -> u16 {
    22
}

/// Create or replace a user record
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserRequest {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Create or replace a group record
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GroupRequest {
    pub name: String,
    pub linux_username: String,
}

/// Update shared settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SettingsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_lease: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_lease: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lease: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_agent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
}
