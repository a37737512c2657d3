//! Records of the relational graph
//!
//! Relations are stored on the owning side: machines list the users and groups granted
//! to them, users list the groups they belong to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Identity presented by the agent; first writer wins
    #[serde(default)]
    pub uuid: Option<String>,
    /// Managed by an agent rather than over SSH
    #[serde(default)]
    pub agent: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Users granted directly; they log in as `root`
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

fn default_port() -> u16 {
    22
}

impl Machine {
    pub fn new(id: impl Into<String>, name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host: host.into(),
            port: default_port(),
            uuid: None,
            agent: false,
            connected: false,
            last_error: None,
            users: Vec::new(),
            groups: Vec::new(),
            last_seen: None,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_users(mut self, users: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.users = users.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `user_id` reaches this machine directly or through one of `user_groups`
    pub fn grants(&self, user_id: &str, user_groups: &[String]) -> bool {
        self.users.iter().any(|u| u == user_id)
            || self.groups.iter().any(|g| user_groups.contains(g))
    }

    pub fn ssh_target(&self) -> nexus_exec::SshTarget {
        nexus_exec::SshTarget::new(self.host.clone(), self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    /// Opaque certificate principal, minted once
    #[serde(default)]
    pub principal: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            principal: String::new(),
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    #[must_use]
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a change from `self` to `other` can alter any principal set
    pub fn access_differs(&self, other: &User) -> bool {
        self.groups != other.groups || self.principal != other.principal
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    /// Login name that members' certificates authorize against
    pub linux_username: String,
}

impl Group {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        linux_username: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            linux_username: linux_username.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_differs_ignores_name() {
        let before = User::new("u-1", "alice").with_principal("p-1").with_groups(["g-ops"]);

        let renamed = User {
            name: "Alice Smith".to_string(),
            ..before.clone()
        };
        assert!(!before.access_differs(&renamed));

        let moved = before.clone().with_groups(["g-dev"]);
        assert!(before.access_differs(&moved));

        let reminted = before.clone().with_principal("p-2");
        assert!(before.access_differs(&reminted));
    }
}
