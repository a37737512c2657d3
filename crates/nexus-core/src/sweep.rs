//! Fleet-wide convergence sweeps
//!
//! Machines are processed concurrently and independently. A failure is recorded on that
//! machine and counted, never propagated to the rest of the sweep.

use std::sync::Arc;

use futures::future::join_all;
use nexus_api::responses::SyncResponse;
use nexus_ca::TokenStore;
use tracing::{info, instrument, warn};

use crate::converge::RemoteConverger;
use crate::error::CoreError;
use crate::model::Machine;
use crate::store::Store;

#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn Store>,
    converger: Arc<dyn RemoteConverger>,
    tokens: Arc<TokenStore>,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn Store>,
        converger: Arc<dyn RemoteConverger>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            store,
            converger,
            tokens,
        }
    }

    /// Manual update on every machine not managed by an agent
    #[instrument(skip(self))]
    pub async fn sync_machines(&self) -> Result<SyncResponse, CoreError> {
        let targets = self.select(|m| !m.agent).await?;
        let converger = &self.converger;
        Ok(tally("sync_machines", &targets, |id| converger.manual_update(id)).await)
    }

    /// Install the agent on every machine without one, when enabled in settings
    #[instrument(skip(self))]
    pub async fn sync_agents(&self) -> Result<SyncResponse, CoreError> {
        if !self.store.settings().await?.install_agent {
            info!("agent installation disabled, skipping");
            return Ok(SyncResponse::default());
        }
        let targets = self.select(|m| !m.agent).await?;
        let converger = &self.converger;
        Ok(tally("sync_agents", &targets, |id| converger.install_agent(id)).await)
    }

    /// Deliver the current token to every agent; retire the previous one on full success
    #[instrument(skip(self))]
    pub async fn sync_token(&self) -> Result<SyncResponse, CoreError> {
        let targets = self.select(|m| m.agent).await?;
        let converger = &self.converger;
        let response = tally("sync_token", &targets, |id| converger.sync_agent_token(id)).await;
        if response.failed == 0 {
            self.tokens.retire_previous()?;
            info!("previous agent token retired");
        }
        Ok(response)
    }

    /// Manual update of a single machine
    pub async fn sync_machine(&self, machine_id: &str) -> Result<(), CoreError> {
        self.converger.manual_update(machine_id).await
    }

    async fn select(&self, filter: impl Fn(&Machine) -> bool) -> Result<Vec<String>, CoreError> {
        Ok(self
            .store
            .machines()
            .await?
            .into_iter()
            .filter(|m| filter(m))
            .map(|m| m.id)
            .collect())
    }
}

async fn tally<'a, F, Fut>(sweep: &str, ids: &'a [String], op: F) -> SyncResponse
where
    F: Fn(&'a str) -> Fut,
    Fut: std::future::Future<Output = Result<(), CoreError>>,
{
    let results = join_all(ids.iter().map(|id| op(id))).await;
    let mut response = SyncResponse {
        total: ids.len(),
        ..SyncResponse::default()
    };
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(()) => response.succeeded += 1,
            Err(e) => {
                warn!(sweep, machine = %id, error = %e, "sweep step failed");
                response.failed += 1;
            }
        }
    }
    info!(sweep, total = response.total, failed = response.failed, "sweep finished");
    response
}
