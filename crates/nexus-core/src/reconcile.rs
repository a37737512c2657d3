//! `Reconciler`: turns change events into deliveries
//!
//! The actor never waits on a machine. Each event is handed to a background task that
//! pushes over a live stream when the machine is connected and falls back to SSH otherwise.
//! Deliveries to the same machine run one at a time and read the store only once they hold
//! the machine's turn, so the last delivery always carries the latest committed state.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use nexus_api::StreamResponse;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::{debug, info, warn};

use crate::converge::RemoteConverger;
use crate::error::CoreError;
use crate::events::ChangeEvent;
use crate::model::{Machine, User};
use crate::registry::RegistryHandle;
use crate::store::{Store, desired_principals};

/// Per-machine delivery turns
#[derive(Clone, Default)]
struct MachineLocks(Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>);

impl MachineLocks {
    async fn acquire(&self, machine_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(machine_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn forget(&self, machine_id: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(machine_id);
    }
}

/// Delivery logic shared by every background task
#[derive(Clone)]
pub struct Reconciliation {
    store: Arc<dyn Store>,
    registry: RegistryHandle,
    converger: Arc<dyn RemoteConverger>,
    locks: MachineLocks,
}

impl Reconciliation {
    pub fn new(
        store: Arc<dyn Store>,
        registry: RegistryHandle,
        converger: Arc<dyn RemoteConverger>,
    ) -> Self {
        Self {
            store,
            registry,
            converger,
            locks: MachineLocks::default(),
        }
    }

    /// React to one committed change
    pub async fn apply(&self, event: ChangeEvent) -> Result<(), CoreError> {
        match event {
            ChangeEvent::SettingsChanged { before, after } => {
                if before.ssh_config != after.ssh_config {
                    let delivered = self
                        .registry
                        .broadcast(StreamResponse::ssh_config(after.ssh_config.into_bytes()))
                        .await?;
                    info!(delivered, "broadcast ssh config");
                }
                Ok(())
            }
            ChangeEvent::MachineChanged { before, after } => match (before, after) {
                (None, Some(created)) => {
                    let _turn = self.locks.acquire(&created.id).await;
                    self.on_machine_created(&created).await
                }
                (Some(_), Some(updated)) => self.deliver(&updated.id).await,
                (Some(deleted), None) => {
                    let turn = self.locks.acquire(&deleted.id).await;
                    let result = self.on_machine_deleted(&deleted).await;
                    drop(turn);
                    self.locks.forget(&deleted.id);
                    result
                }
                (None, None) => Ok(()),
            },
            ChangeEvent::UserChanged { before, after } => {
                if let (Some(b), Some(a)) = (&before, &after)
                    && !b.access_differs(a)
                {
                    debug!(user = %a.id, "user change does not affect access");
                    return Ok(());
                }
                let machines = self.store.machines().await?;
                let ids = affected_by_users(&machines, [before.as_ref(), after.as_ref()]);
                self.deliver_all(ids).await;
                Ok(())
            }
            ChangeEvent::GroupChanged { before, after } => {
                let Some(group_id) = after.as_ref().or(before.as_ref()).map(|g| g.id.clone())
                else {
                    return Ok(());
                };
                let ids = self
                    .store
                    .machines()
                    .await?
                    .into_iter()
                    .filter(|m| m.groups.contains(&group_id))
                    .map(|m| m.id)
                    .collect();
                self.deliver_all(ids).await;
                Ok(())
            }
        }
    }

    /// Bring one machine to its desired state
    ///
    /// Waits for any earlier delivery to the same machine to finish first.
    pub async fn deliver(&self, machine_id: &str) -> Result<(), CoreError> {
        let _turn = self.locks.acquire(machine_id).await;
        if self.registry.is_connected(machine_id).await? {
            let Some(machine) = self.store.machine(machine_id).await? else {
                return Err(CoreError::MachineNotFound(machine_id.to_string()));
            };
            let principals = desired_principals(self.store.as_ref(), &machine).await?;
            if !self
                .registry
                .push(machine_id, StreamResponse::principals(principals.to_wire()))
                .await?
            {
                warn!(machine = %machine_id, "principal push not delivered");
            }
            return Ok(());
        }
        self.converger.manual_update(machine_id).await
    }

    /// Deliver to every machine in `ids` concurrently; failures are logged per machine
    pub async fn deliver_all(&self, ids: BTreeSet<String>) {
        let results = join_all(ids.iter().map(|id| self.deliver(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(machine = %id, error = %e, "delivery failed");
            }
        }
    }

    async fn on_machine_created(&self, machine: &Machine) -> Result<(), CoreError> {
        if self.store.settings().await?.install_agent {
            match self.converger.install_agent(&machine.id).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    machine = %machine.id,
                    error = %e,
                    "agent install failed, converging over ssh"
                ),
            }
        }
        self.converger.manual_update(&machine.id).await
    }

    async fn on_machine_deleted(&self, machine: &Machine) -> Result<(), CoreError> {
        if self.registry.push(&machine.id, StreamResponse::restore()).await? {
            info!(machine = %machine.id, "restore signalled to agent");
            return Ok(());
        }
        self.converger.restore(machine).await
    }
}

/// Machines reachable by any of `users` through a direct grant or a group
fn affected_by_users<'a>(
    machines: &[Machine],
    users: impl IntoIterator<Item = Option<&'a User>>,
) -> BTreeSet<String> {
    let users: Vec<&User> = users.into_iter().flatten().collect();
    machines
        .iter()
        .filter(|m| users.iter().any(|u| m.grants(&u.id, &u.groups)))
        .map(|m| m.id.clone())
        .collect()
}

/// Reconciliation actor
pub struct Reconciler {
    reconciliation: Reconciliation,
}

pub struct ReconcilerArgs {
    pub store: Arc<dyn Store>,
    pub registry: RegistryHandle,
    pub converger: Arc<dyn RemoteConverger>,
}

impl Actor for Reconciler {
    type Args = ReconcilerArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(id = %actor_ref.id(), "Reconciler starting");
        Ok(Self {
            reconciliation: Reconciliation::new(args.store, args.registry, args.converger),
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, "Reconciler stopping");
        Ok(())
    }
}

/// A committed change to react to
#[derive(Debug)]
pub struct Reconcile(pub ChangeEvent);

/// Force delivery to one machine, or to the whole fleet
#[derive(Debug)]
pub struct Resync {
    pub machine_id: Option<String>,
}

impl Message<Reconcile> for Reconciler {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Reconcile,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let reconciliation = self.reconciliation.clone();
        let kind = msg.0.kind();
        tokio::spawn(async move {
            if let Err(e) = reconciliation.apply(msg.0).await {
                warn!(kind, error = %e, "reconciliation failed");
            }
        });
    }
}

impl Message<Resync> for Reconciler {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Resync,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let reconciliation = self.reconciliation.clone();
        tokio::spawn(async move {
            let ids = match msg.machine_id {
                Some(id) => BTreeSet::from([id]),
                None => match reconciliation.store.machines().await {
                    Ok(machines) => machines.into_iter().map(|m| m.id).collect(),
                    Err(e) => {
                        warn!(error = %e, "resync could not list machines");
                        return;
                    }
                },
            };
            info!(count = ids.len(), "resync");
            reconciliation.deliver_all(ids).await;
        });
    }
}

/// Spawn the reconciler and feed it from `events`
///
/// A lagging subscriber falls back to a fleet-wide resync.
pub fn spawn_reconciler(
    args: ReconcilerArgs,
    mut events: broadcast::Receiver<ChangeEvent>,
) -> ActorRef<Reconciler> {
    let actor = Reconciler::spawn(args);
    let feed = actor.clone();
    tokio::spawn(async move {
        loop {
            let sent = match events.recv().await {
                Ok(event) => feed.tell(Reconcile(event)).await.map_err(|e| e.to_string()),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "change feed lagged, resyncing fleet");
                    feed.tell(Resync { machine_id: None }).await.map_err(|e| e.to_string())
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if let Err(e) = sent {
                warn!(error = %e, "reconciler unavailable, stopping change feed");
                break;
            }
        }
    });
    actor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affected_by_users_unions_before_and_after() {
        let machines = vec![
            Machine::new("m-ops", "a", "10.0.0.1").with_groups(["g-ops"]),
            Machine::new("m-dev", "b", "10.0.0.2").with_groups(["g-dev"]),
            Machine::new("m-direct", "c", "10.0.0.3").with_users(["u-1"]),
            Machine::new("m-other", "d", "10.0.0.4"),
        ];
        let before = User::new("u-1", "alice").with_groups(["g-ops"]);
        let after = User::new("u-1", "alice").with_groups(["g-dev"]);

        let ids = affected_by_users(&machines, [Some(&before), Some(&after)]);
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["m-dev", "m-direct", "m-ops"]
        );
    }
}
