//! Typed change events and the operator-facing record API
//!
//! [`Records`] commits a mutation to the [`Store`] and then broadcasts one [`ChangeEvent`]
//! carrying the versions before and after the change.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::model::{Group, Machine, User};
use crate::settings::Settings;
use crate::store::Store;

#[derive(Debug, Clone)]
pub enum ChangeEvent {
    MachineChanged {
        before: Option<Machine>,
        after: Option<Machine>,
    },
    UserChanged {
        before: Option<User>,
        after: Option<User>,
    },
    GroupChanged {
        before: Option<Group>,
        after: Option<Group>,
    },
    SettingsChanged {
        before: Settings,
        after: Settings,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::MachineChanged { .. } => "machine",
            ChangeEvent::UserChanged { .. } => "user",
            ChangeEvent::GroupChanged { .. } => "group",
            ChangeEvent::SettingsChanged { .. } => "settings",
        }
    }
}

/// Operator mutations with change notification
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn Store>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Records {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ChangeEvent) {
        debug!(kind = event.kind(), "emitting change event");
        // No subscriber is fine
        let _ = self.events.send(event);
    }

    /// Create or replace a machine's operator-owned fields
    ///
    /// Identity and connection state are owned by the agent protocol and carried over.
    pub async fn put_machine(&self, mut machine: Machine) -> Result<Machine, CoreError> {
        let before = self.store.machine(&machine.id).await?;
        match &before {
            Some(prev) => {
                machine.uuid.clone_from(&prev.uuid);
                machine.agent = prev.agent;
                machine.connected = prev.connected;
                machine.last_error.clone_from(&prev.last_error);
                machine.last_seen = prev.last_seen;
            }
            None => {
                machine.agent = false;
                machine.connected = false;
            }
        }
        self.store.save_machine(machine.clone()).await?;
        info!(machine = %machine.id, created = before.is_none(), "machine saved");
        self.emit(ChangeEvent::MachineChanged {
            before,
            after: Some(machine.clone()),
        });
        Ok(machine)
    }

    pub async fn delete_machine(&self, id: &str) -> Result<Machine, CoreError> {
        let removed = self
            .store
            .delete_machine(id)
            .await?
            .ok_or_else(|| CoreError::MachineNotFound(id.to_string()))?;
        info!(machine = %id, "machine deleted");
        self.emit(ChangeEvent::MachineChanged {
            before: Some(removed.clone()),
            after: None,
        });
        Ok(removed)
    }

    /// Create or replace a user; a principal is minted once and never replaced
    pub async fn put_user(&self, mut user: User) -> Result<User, CoreError> {
        let before = self.store.user(&user.id).await?;
        match before.as_ref().filter(|prev| !prev.principal.is_empty()) {
            Some(prev) => user.principal.clone_from(&prev.principal),
            None if user.principal.is_empty() => user.principal = uuid::Uuid::new_v4().to_string(),
            None => {}
        }
        self.store.save_user(user.clone()).await?;
        info!(user = %user.id, "user saved");
        self.emit(ChangeEvent::UserChanged {
            before,
            after: Some(user.clone()),
        });
        Ok(user)
    }

    pub async fn delete_user(&self, id: &str) -> Result<User, CoreError> {
        let removed = self
            .store
            .delete_user(id)
            .await?
            .ok_or_else(|| CoreError::UserNotFound(id.to_string()))?;
        info!(user = %id, "user deleted");
        self.emit(ChangeEvent::UserChanged {
            before: Some(removed.clone()),
            after: None,
        });
        Ok(removed)
    }

    pub async fn put_group(&self, group: Group) -> Result<Group, CoreError> {
        let before = self.store.save_group(group.clone()).await?;
        info!(group = %group.id, "group saved");
        self.emit(ChangeEvent::GroupChanged {
            before,
            after: Some(group.clone()),
        });
        Ok(group)
    }

    pub async fn delete_group(&self, id: &str) -> Result<Group, CoreError> {
        let removed = self
            .store
            .delete_group(id)
            .await?
            .ok_or_else(|| CoreError::GroupNotFound(id.to_string()))?;
        info!(group = %id, "group deleted");
        self.emit(ChangeEvent::GroupChanged {
            before: Some(removed.clone()),
            after: None,
        });
        Ok(removed)
    }

    pub async fn update_settings(
        &self,
        edit: impl FnOnce(&mut Settings) + Send,
    ) -> Result<Settings, CoreError> {
        let mut after = self.store.settings().await?;
        edit(&mut after);
        let before = self.store.save_settings(after.clone()).await?;
        info!("settings saved");
        self.emit(ChangeEvent::SettingsChanged {
            before,
            after: after.clone(),
        });
        Ok(after)
    }
}
