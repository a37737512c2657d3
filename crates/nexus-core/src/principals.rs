//! Principal reconciliation
//!
//! Computes, per machine, which certificate principals may log in as which login name.

use std::collections::BTreeMap;

use nexus_api::Principal;

use crate::model::{Group, Machine, User};

/// Login name that is always present and always authorizes the `root` principal
pub const ROOT_LOGIN: &str = "root";

/// Login name → principals, values kept unique in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalSet {
    entries: BTreeMap<String, Vec<String>>,
}

impl PrincipalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, login: &str, principal: &str) {
        let values = self.entries.entry(login.to_string()).or_default();
        if !values.iter().any(|v| v == principal) {
            values.push(principal.to_string());
        }
    }

    /// Put `root` first in the `root` entry, creating the entry when absent
    pub fn enforce_root(&mut self) {
        let values = self.entries.entry(ROOT_LOGIN.to_string()).or_default();
        values.retain(|v| v != ROOT_LOGIN);
        values.insert(0, ROOT_LOGIN.to_string());
    }

    pub fn get(&self, login: &str) -> Option<&[String]> {
        self.entries.get(login).map(Vec::as_slice)
    }

    pub fn logins(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire form for the agent stream
    pub fn to_wire(&self) -> Vec<Principal> {
        self.iter()
            .map(|(key, values)| Principal {
                key: key.to_string(),
                values: values.to_vec(),
            })
            .collect()
    }

    /// Rebuild from the wire form, merging duplicate keys and re-applying the root rule
    pub fn from_wire(principals: &[Principal]) -> Self {
        let mut set = Self::new();
        for principal in principals {
            for value in &principal.values {
                set.insert(&principal.key, value);
            }
            set.entries.entry(principal.key.clone()).or_default();
        }
        set.enforce_root();
        set
    }

    /// Principal file contents of a login name, newline separated
    pub fn file_contents(values: &[String]) -> String {
        let mut contents = values.join("\n");
        contents.push('\n');
        contents
    }
}

/// Desired principal set of `machine`
///
/// Users granted directly map to `root`; members of granted groups map to the group's
/// login name. Users without a principal contribute nothing. Unknown ids are ignored.
pub fn compute_principals(machine: &Machine, users: &[User], groups: &[Group]) -> PrincipalSet {
    let mut set = PrincipalSet::new();

    for group in groups.iter().filter(|g| machine.groups.contains(&g.id)) {
        for user in users.iter().filter(|u| u.groups.contains(&group.id)) {
            if !user.principal.is_empty() {
                set.insert(&group.linux_username, &user.principal);
            }
        }
    }

    for user in users.iter().filter(|u| machine.users.contains(&u.id)) {
        if !user.principal.is_empty() {
            set.insert(ROOT_LOGIN, &user.principal);
        }
    }

    set.enforce_root();
    set
}
