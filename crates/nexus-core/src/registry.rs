//! `ConnectionRegistry`: owner of the live agent connections
//!
//! Every read and write of the machine-id → stream table goes through this actor's mailbox.
//! A newer connection for the same machine replaces the older one and cancels its scope.

use std::collections::HashMap;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use nexus_api::StreamResponse;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;

/// Identifies one accepted stream; a reconnect gets a new id
pub type ConnectionId = u64;

struct Connection {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<StreamResponse>,
    cancel: CancellationToken,
}

/// Registry of active agent streams
pub struct ConnectionRegistry {
    connections: HashMap<String, Connection>,
    next_id: ConnectionId,
}

impl Actor for ConnectionRegistry {
    type Args = ();
    type Error = CoreError;

    async fn on_start(_args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(id = %actor_ref.id(), "ConnectionRegistry starting");
        Ok(Self {
            connections: HashMap::new(),
            next_id: 1,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, open = self.connections.len(), "ConnectionRegistry stopping");
        for (_, conn) in self.connections.drain() {
            conn.cancel.cancel();
        }
        Ok(())
    }
}

/// Add a connection, replacing any previous one for the machine
#[derive(Debug)]
pub struct Register {
    pub machine_id: String,
    pub sender: mpsc::UnboundedSender<StreamResponse>,
    pub cancel: CancellationToken,
}

/// Remove a connection if it is still the current one for the machine
#[derive(Debug)]
pub struct Unregister {
    pub machine_id: String,
    pub conn_id: ConnectionId,
}

/// Queue a message on one machine's stream
#[derive(Debug)]
pub struct Push {
    pub machine_id: String,
    pub response: StreamResponse,
}

/// Queue a message on every stream
#[derive(Debug)]
pub struct Broadcast {
    pub response: StreamResponse,
}

#[derive(Debug)]
pub struct IsConnected {
    pub machine_id: String,
}

#[derive(Debug)]
pub struct ConnectedIds;

/// Cancel and drop a machine's connection
#[derive(Debug)]
pub struct Disconnect {
    pub machine_id: String,
}

impl Message<Register> for ConnectionRegistry {
    type Reply = ConnectionId;

    async fn handle(
        &mut self,
        msg: Register,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let id = self.next_id;
        self.next_id += 1;

        let conn = Connection {
            id,
            sender: msg.sender,
            cancel: msg.cancel,
        };
        if let Some(old) = self.connections.insert(msg.machine_id.clone(), conn) {
            info!(machine = %msg.machine_id, replaced = old.id, "replacing agent connection");
            old.cancel.cancel();
        }
        debug!(machine = %msg.machine_id, conn = id, "connection registered");
        id
    }
}

impl Message<Unregister> for ConnectionRegistry {
    type Reply = bool;

    async fn handle(
        &mut self,
        msg: Unregister,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match self.connections.get(&msg.machine_id) {
            Some(conn) if conn.id == msg.conn_id => {
                self.connections.remove(&msg.machine_id);
                debug!(machine = %msg.machine_id, conn = msg.conn_id, "connection unregistered");
                true
            }
            _ => false,
        }
    }
}

impl Message<Push> for ConnectionRegistry {
    type Reply = bool;

    async fn handle(
        &mut self,
        msg: Push,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let Some(conn) = self.connections.get(&msg.machine_id) else {
            return false;
        };
        if conn.sender.send(msg.response).is_err() {
            warn!(machine = %msg.machine_id, "push to closed stream");
            return false;
        }
        true
    }
}

impl Message<Broadcast> for ConnectionRegistry {
    type Reply = usize;

    async fn handle(
        &mut self,
        msg: Broadcast,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut delivered = 0;
        for (machine_id, conn) in &self.connections {
            if conn.sender.send(msg.response.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(machine = %machine_id, "broadcast to closed stream");
            }
        }
        delivered
    }
}

impl Message<IsConnected> for ConnectionRegistry {
    type Reply = bool;

    async fn handle(
        &mut self,
        msg: IsConnected,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.connections.contains_key(&msg.machine_id)
    }
}

impl Message<ConnectedIds> for ConnectionRegistry {
    type Reply = Vec<String>;

    async fn handle(
        &mut self,
        _msg: ConnectedIds,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut ids: Vec<String> = self.connections.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Message<Disconnect> for ConnectionRegistry {
    type Reply = bool;

    async fn handle(
        &mut self,
        msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match self.connections.remove(&msg.machine_id) {
            Some(conn) => {
                conn.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Thin typed handle over the registry actor
#[derive(Clone)]
pub struct RegistryHandle {
    actor: ActorRef<ConnectionRegistry>,
}

impl RegistryHandle {
    pub fn spawn() -> Self {
        Self {
            actor: ConnectionRegistry::spawn(()),
        }
    }

    pub fn actor(&self) -> &ActorRef<ConnectionRegistry> {
        &self.actor
    }

    pub async fn register(
        &self,
        machine_id: &str,
        sender: mpsc::UnboundedSender<StreamResponse>,
        cancel: CancellationToken,
    ) -> Result<ConnectionId, CoreError> {
        self.actor
            .ask(Register {
                machine_id: machine_id.to_string(),
                sender,
                cancel,
            })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    pub async fn unregister(
        &self,
        machine_id: &str,
        conn_id: ConnectionId,
    ) -> Result<bool, CoreError> {
        self.actor
            .ask(Unregister {
                machine_id: machine_id.to_string(),
                conn_id,
            })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    pub async fn push(
        &self,
        machine_id: &str,
        response: StreamResponse,
    ) -> Result<bool, CoreError> {
        self.actor
            .ask(Push {
                machine_id: machine_id.to_string(),
                response,
            })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    pub async fn broadcast(&self, response: StreamResponse) -> Result<usize, CoreError> {
        self.actor
            .ask(Broadcast { response })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    pub async fn is_connected(&self, machine_id: &str) -> Result<bool, CoreError> {
        self.actor
            .ask(IsConnected {
                machine_id: machine_id.to_string(),
            })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    pub async fn connected_ids(&self) -> Result<Vec<String>, CoreError> {
        self.actor
            .ask(ConnectedIds)
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    pub async fn disconnect(&self, machine_id: &str) -> Result<bool, CoreError> {
        self.actor
            .ask(Disconnect {
                machine_id: machine_id.to_string(),
            })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_reaches_registered_stream() {
        let registry = RegistryHandle::spawn();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("m-1", tx, CancellationToken::new()).await.unwrap();

        assert!(registry.push("m-1", StreamResponse::restore()).await.unwrap());
        assert!(rx.recv().await.unwrap().is_restore());
        assert!(!registry.push("m-2", StreamResponse::restore()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnect_cancels_previous_stream() {
        let registry = RegistryHandle::spawn();
        let old_cancel = CancellationToken::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let old_id = registry.register("m-1", old_tx, old_cancel.clone()).await.unwrap();

        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        let new_id = registry
            .register("m-1", new_tx, CancellationToken::new())
            .await
            .unwrap();

        assert_ne!(old_id, new_id);
        assert!(old_cancel.is_cancelled());
        // Late close of the replaced stream must not evict the new one
        assert!(!registry.unregister("m-1", old_id).await.unwrap());
        assert!(registry.is_connected("m-1").await.unwrap());
        assert!(registry.unregister("m-1", new_id).await.unwrap());
        assert!(!registry.is_connected("m-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_counts_live_streams() {
        let registry = RegistryHandle::spawn();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        registry.register("a", tx_a, CancellationToken::new()).await.unwrap();
        registry.register("b", tx_b, CancellationToken::new()).await.unwrap();
        drop(rx_b);

        let delivered = registry
            .broadcast(StreamResponse::ssh_config(b"X".to_vec()))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(registry.connected_ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_scope() {
        let registry = RegistryHandle::spawn();
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("m-1", tx, cancel.clone()).await.unwrap();

        assert!(registry.disconnect("m-1").await.unwrap());
        assert!(cancel.is_cancelled());
        assert!(!registry.disconnect("m-1").await.unwrap());
    }
}
