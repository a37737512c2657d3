//! Record store collaborator
//!
//! Saves through [`Store`] are silent. Operator mutations go through
//! [`Records`](crate::events::Records), which commits here and then emits change events.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::model::{Group, Machine, User};
use crate::principals::{PrincipalSet, compute_principals};
use crate::settings::Settings;

/// In-place edit applied atomically by [`Store::modify_machine`]
pub type MachineEdit = Box<dyn FnOnce(&mut Machine) + Send>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn machine(&self, id: &str) -> Result<Option<Machine>, CoreError>;
    async fn machine_by_uuid(&self, uuid: &str) -> Result<Option<Machine>, CoreError>;
    async fn machine_by_host(&self, host: &str) -> Result<Option<Machine>, CoreError>;
    async fn machines(&self) -> Result<Vec<Machine>, CoreError>;
    /// Insert or replace; returns the previous version
    async fn save_machine(&self, machine: Machine) -> Result<Option<Machine>, CoreError>;
    /// Apply `edit` to a stored machine; returns the updated version
    async fn modify_machine(
        &self,
        id: &str,
        edit: MachineEdit,
    ) -> Result<Option<Machine>, CoreError>;
    async fn delete_machine(&self, id: &str) -> Result<Option<Machine>, CoreError>;

    async fn user(&self, id: &str) -> Result<Option<User>, CoreError>;
    async fn users(&self) -> Result<Vec<User>, CoreError>;
    async fn save_user(&self, user: User) -> Result<Option<User>, CoreError>;
    async fn delete_user(&self, id: &str) -> Result<Option<User>, CoreError>;

    async fn group(&self, id: &str) -> Result<Option<Group>, CoreError>;
    async fn groups(&self) -> Result<Vec<Group>, CoreError>;
    async fn save_group(&self, group: Group) -> Result<Option<Group>, CoreError>;
    async fn delete_group(&self, id: &str) -> Result<Option<Group>, CoreError>;

    async fn settings(&self) -> Result<Settings, CoreError>;
    /// Replace settings; returns the previous value
    async fn save_settings(&self, settings: Settings) -> Result<Settings, CoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    machines: BTreeMap<String, Machine>,
    users: BTreeMap<String, User>,
    groups: BTreeMap<String, Group>,
    settings: Settings,
}

/// Process-local store seeded from configuration
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            tables: RwLock::new(Tables {
                settings,
                ..Tables::default()
            }),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn machine(&self, id: &str) -> Result<Option<Machine>, CoreError> {
        Ok(self.tables.read().await.machines.get(id).cloned())
    }

    async fn machine_by_uuid(&self, uuid: &str) -> Result<Option<Machine>, CoreError> {
        Ok(self
            .tables
            .read()
            .await
            .machines
            .values()
            .find(|m| m.uuid.as_deref() == Some(uuid))
            .cloned())
    }

    async fn machine_by_host(&self, host: &str) -> Result<Option<Machine>, CoreError> {
        Ok(self
            .tables
            .read()
            .await
            .machines
            .values()
            .find(|m| m.host == host)
            .cloned())
    }

    async fn machines(&self) -> Result<Vec<Machine>, CoreError> {
        Ok(self.tables.read().await.machines.values().cloned().collect())
    }

    async fn save_machine(&self, machine: Machine) -> Result<Option<Machine>, CoreError> {
        Ok(self
            .tables
            .write()
            .await
            .machines
            .insert(machine.id.clone(), machine))
    }

    async fn modify_machine(
        &self,
        id: &str,
        edit: MachineEdit,
    ) -> Result<Option<Machine>, CoreError> {
        let mut tables = self.tables.write().await;
        Ok(tables.machines.get_mut(id).map(|machine| {
            edit(machine);
            machine.clone()
        }))
    }

    async fn delete_machine(&self, id: &str) -> Result<Option<Machine>, CoreError> {
        Ok(self.tables.write().await.machines.remove(id))
    }

    async fn user(&self, id: &str) -> Result<Option<User>, CoreError> {
        Ok(self.tables.read().await.users.get(id).cloned())
    }

    async fn users(&self) -> Result<Vec<User>, CoreError> {
        Ok(self.tables.read().await.users.values().cloned().collect())
    }

    async fn save_user(&self, user: User) -> Result<Option<User>, CoreError> {
        Ok(self.tables.write().await.users.insert(user.id.clone(), user))
    }

    async fn delete_user(&self, id: &str) -> Result<Option<User>, CoreError> {
        Ok(self.tables.write().await.users.remove(id))
    }

    async fn group(&self, id: &str) -> Result<Option<Group>, CoreError> {
        Ok(self.tables.read().await.groups.get(id).cloned())
    }

    async fn groups(&self) -> Result<Vec<Group>, CoreError> {
        Ok(self.tables.read().await.groups.values().cloned().collect())
    }

    async fn save_group(&self, group: Group) -> Result<Option<Group>, CoreError> {
        Ok(self.tables.write().await.groups.insert(group.id.clone(), group))
    }

    async fn delete_group(&self, id: &str) -> Result<Option<Group>, CoreError> {
        Ok(self.tables.write().await.groups.remove(id))
    }

    async fn settings(&self) -> Result<Settings, CoreError> {
        Ok(self.tables.read().await.settings.clone())
    }

    async fn save_settings(&self, settings: Settings) -> Result<Settings, CoreError> {
        Ok(std::mem::replace(
            &mut self.tables.write().await.settings,
            settings,
        ))
    }
}

/// Set or clear the error recorded on a machine
pub async fn record_error(
    store: &dyn Store,
    machine_id: &str,
    error: Option<String>,
) -> Result<(), CoreError> {
    store
        .modify_machine(machine_id, Box::new(move |m| m.last_error = error))
        .await?;
    Ok(())
}

/// Desired principal set of `machine` from the current users and groups
pub async fn desired_principals(
    store: &dyn Store,
    machine: &Machine,
) -> Result<PrincipalSet, CoreError> {
    let users = store.users().await?;
    let groups = store.groups().await?;
    Ok(compute_principals(machine, &users, &groups))
}
