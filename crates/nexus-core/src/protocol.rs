//! Server half of the agent stream
//!
//! A connection moves through authentication (bearer token and identity headers), identity
//! binding against the machine records, registration, and then a receive loop that answers
//! host certificate requests and relays pushes queued in the registry.

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use nexus_api::{StreamRequest, StreamResponse};
use nexus_ca::{CertificateAuthority, TokenStore};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::CoreError;
use crate::model::Machine;
use crate::registry::RegistryHandle;
use crate::store::{Store, desired_principals, record_error};

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The connecting identity differs from the one bound to the machine
    #[error("identity conflict on machine {machine}: bound to {bound}, presented {presented}")]
    IdentityConflict {
        machine: String,
        bound: String,
        presented: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for ProtocolError {
    fn from(e: CoreError) -> Self {
        ProtocolError::Internal(e.to_string())
    }
}

impl From<nexus_ca::CaError> for ProtocolError {
    fn from(e: nexus_ca::CaError) -> Self {
        ProtocolError::Internal(e.to_string())
    }
}

/// Metadata presented before the stream is established
#[derive(Debug, Clone, Default)]
pub struct AgentMetadata {
    pub authorization: Option<String>,
    pub agent_id: Option<String>,
    pub hostname: Option<String>,
    /// Peer network address, used to find the record on first contact
    pub remote_addr: String,
}

/// Authenticated identity of a connecting agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub hostname: String,
    pub remote_addr: String,
}

#[derive(Clone)]
pub struct ProtocolServer {
    store: Arc<dyn Store>,
    registry: RegistryHandle,
    ca: Arc<CertificateAuthority>,
    tokens: Arc<TokenStore>,
    shutdown: CancellationToken,
}

impl ProtocolServer {
    pub fn new(
        store: Arc<dyn Store>,
        registry: RegistryHandle,
        ca: Arc<CertificateAuthority>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            store,
            registry,
            ca,
            tokens,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling `shutdown` closes every session
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Check the bearer token and required identity headers
    pub fn authenticate(&self, meta: &AgentMetadata) -> Result<AgentIdentity, ProtocolError> {
        let authorization = non_empty(meta.authorization.as_deref())
            .ok_or_else(|| ProtocolError::InvalidArgument("missing authorization".to_string()))?;
        let token = authorization
            .strip_prefix(BEARER_PREFIX)
            .ok_or_else(|| ProtocolError::Unauthenticated("expected bearer token".to_string()))?;
        if !self.tokens.validate(token.trim())? {
            return Err(ProtocolError::Unauthenticated("invalid token".to_string()));
        }

        let agent_id = non_empty(meta.agent_id.as_deref())
            .ok_or_else(|| ProtocolError::InvalidArgument("missing agent id".to_string()))?;
        let hostname = non_empty(meta.hostname.as_deref())
            .ok_or_else(|| ProtocolError::InvalidArgument("missing hostname".to_string()))?;

        Ok(AgentIdentity {
            agent_id: agent_id.to_string(),
            hostname: hostname.to_string(),
            remote_addr: meta.remote_addr.clone(),
        })
    }

    /// Resolve or create the machine for `identity` and mark it connected
    ///
    /// Lookup is by bound identity first, then by network address. A record already bound
    /// to another identity is rejected and the conflict is recorded on it.
    #[instrument(skip(self), fields(agent = %identity.agent_id))]
    pub async fn bind_identity(&self, identity: &AgentIdentity) -> Result<Machine, ProtocolError> {
        let existing = match self.store.machine_by_uuid(&identity.agent_id).await? {
            Some(machine) => Some(machine),
            None => self.store.machine_by_host(&identity.remote_addr).await?,
        };

        let machine_id = match existing {
            Some(machine) => match machine.uuid.as_deref().filter(|u| !u.is_empty()) {
                Some(bound) if bound != identity.agent_id => {
                    let conflict = ProtocolError::IdentityConflict {
                        machine: machine.id.clone(),
                        bound: bound.to_string(),
                        presented: identity.agent_id.clone(),
                    };
                    warn!(machine = %machine.id, "rejecting agent with conflicting identity");
                    let message = conflict.to_string();
                    record_error(self.store.as_ref(), &machine.id, Some(message)).await?;
                    return Err(conflict);
                }
                _ => machine.id,
            },
            None => {
                let machine = Machine::new(
                    uuid::Uuid::new_v4().to_string(),
                    identity.hostname.clone(),
                    identity.remote_addr.clone(),
                );
                info!(machine = %machine.id, host = %machine.host, "registering new machine");
                let id = machine.id.clone();
                self.store.save_machine(machine).await?;
                id
            }
        };

        let agent_id = identity.agent_id.clone();
        self.store
            .modify_machine(
                &machine_id,
                Box::new(move |m| {
                    m.uuid = Some(agent_id);
                    m.agent = true;
                    m.connected = true;
                    m.last_error = None;
                    m.last_seen = Some(Utc::now());
                }),
            )
            .await?
            .ok_or_else(|| ProtocolError::Internal(format!("machine {machine_id} vanished")))
    }

    /// First message pushed on a new stream
    pub async fn initial_response(
        &self,
        machine: &Machine,
    ) -> Result<StreamResponse, ProtocolError> {
        let settings = self.store.settings().await?;
        let principals = desired_principals(self.store.as_ref(), machine).await?;
        Ok(StreamResponse {
            ssh_config: Some(settings.ssh_config.into_bytes()),
            user_certificate_authority_public_key: Some(self.ca.user_ca_public_key()?.into_bytes()),
            principals: principals.to_wire(),
            ..StreamResponse::default()
        })
    }

    /// Answer one agent request; only a host key produces a reply
    #[instrument(skip(self, request))]
    pub async fn handle_request(
        &self,
        machine_id: &str,
        request: StreamRequest,
    ) -> Result<Option<StreamResponse>, ProtocolError> {
        let seen = self
            .store
            .modify_machine(machine_id, Box::new(|m| m.last_seen = Some(Utc::now())))
            .await?;
        let Some(public_key) = non_empty(request.public_host_key.as_deref()) else {
            debug!(version = ?request.version, "request without host key");
            return Ok(None);
        };
        let Some(machine) = seen else {
            return Err(ProtocolError::Internal(format!("machine {machine_id} not found")));
        };

        let ttl = self.store.settings().await?.host_policy().lease(None);
        let signed = self.ca.sign_host(public_key, &machine.name, ttl)?;
        info!(machine = %machine_id, expiry = signed.expiry, "issued host certificate");

        let mut certificate = signed.certificate;
        certificate.push('\n');
        Ok(Some(StreamResponse::host_certificate(certificate)))
    }

    /// Drive one bound connection until either side closes or the scope is cancelled
    pub async fn run_session<I, O, E>(
        &self,
        machine: Machine,
        mut incoming: I,
        mut outgoing: O,
    ) -> Result<(), ProtocolError>
    where
        I: Stream<Item = Result<StreamRequest, E>> + Unpin + Send,
        E: Display,
        O: Sink<StreamResponse> + Unpin + Send,
        O::Error: Display,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        let conn_id = self.registry.register(&machine.id, tx, cancel.clone()).await?;
        info!(machine = %machine.id, conn = conn_id, "agent connected");

        let result = self
            .pump(&machine, &mut incoming, &mut outgoing, &mut rx, &cancel)
            .await;

        cancel.cancel();
        if self.registry.unregister(&machine.id, conn_id).await? {
            self.store
                .modify_machine(&machine.id, Box::new(|m| m.connected = false))
                .await?;
        }
        info!(machine = %machine.id, conn = conn_id, "agent disconnected");
        result
    }

    async fn pump<I, O, E>(
        &self,
        machine: &Machine,
        incoming: &mut I,
        outgoing: &mut O,
        rx: &mut mpsc::UnboundedReceiver<StreamResponse>,
        cancel: &CancellationToken,
    ) -> Result<(), ProtocolError>
    where
        I: Stream<Item = Result<StreamRequest, E>> + Unpin + Send,
        E: Display,
        O: Sink<StreamResponse> + Unpin + Send,
        O::Error: Display,
    {
        let init = self.initial_response(machine).await?;
        send(outgoing, init).await?;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(machine = %machine.id, "session cancelled");
                    return Ok(());
                }
                Some(response) = rx.recv() => {
                    send(outgoing, response).await?;
                }
                next = incoming.next() => match next {
                    Some(Ok(request)) => match self.handle_request(&machine.id, request).await {
                        Ok(Some(response)) => send(outgoing, response).await?,
                        Ok(None) => {}
                        Err(e) => warn!(machine = %machine.id, error = %e, "request failed"),
                    },
                    Some(Err(e)) => {
                        warn!(machine = %machine.id, error = %e, "stream read failed");
                        return Ok(());
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}

async fn send<O>(outgoing: &mut O, response: StreamResponse) -> Result<(), ProtocolError>
where
    O: Sink<StreamResponse> + Unpin,
    O::Error: Display,
{
    outgoing
        .send(response)
        .await
        .map_err(|e| ProtocolError::Internal(format!("stream write failed: {e}")))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
