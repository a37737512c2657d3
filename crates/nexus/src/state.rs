//! Application state shared across HTTP handlers

use std::sync::Arc;

use kameo::actor::ActorRef;
use nexus_ca::{CertificateAuthority, TokenStore};
use nexus_core::{ProtocolServer, Reconciler, Records, RegistryHandle, Store, Sweeper};

use crate::config::Config;
use crate::tls::TlsManager;

/// Application state shared across all handlers
pub struct AppState {
    pub config: Arc<Config>,
    /// Operator mutations; every write emits a change event
    pub records: Records,
    pub ca: Arc<CertificateAuthority>,
    pub tokens: Arc<TokenStore>,
    /// Server half of the agent stream
    pub protocol: ProtocolServer,
    pub sweeper: Arc<Sweeper>,
    pub reconciler: ActorRef<Reconciler>,
    pub tls: Arc<TlsManager>,
}

impl AppState {
    pub fn store(&self) -> &Arc<dyn Store> {
        self.records.store()
    }

    pub fn registry(&self) -> &RegistryHandle {
        self.protocol.registry()
    }
}
