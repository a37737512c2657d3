//! On-demand sweeps

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use nexus_api::responses::{StatusResponse, SyncResponse};
use nexus_core::{CoreError, Resync};

use crate::api::error::AppError;
use crate::state::AppState;

/// Converge every machine managed over SSH
///
/// # Errors
/// Returns error if the machine list cannot be read
pub async fn sync_machines(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SyncResponse>, AppError> {
    Ok(Json(state.sweeper.sync_machines().await?))
}

/// Install the agent wherever it is missing
///
/// # Errors
/// Returns error if the machine list cannot be read
pub async fn sync_agents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SyncResponse>, AppError> {
    Ok(Json(state.sweeper.sync_agents().await?))
}

/// Deliver the current token to every agent machine
///
/// # Errors
/// Returns error if the machine list cannot be read
pub async fn sync_token(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SyncResponse>, AppError> {
    Ok(Json(state.sweeper.sync_token().await?))
}

/// Force one machine to its desired state
///
/// A machine with a live stream gets a push; any other is converged over SSH before the
/// response is sent.
///
/// # Errors
/// Returns 404 for an unknown machine, 500 if convergence failed
pub async fn sync_machine(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    if state.store().machine(&id).await?.is_none() {
        return Err(CoreError::MachineNotFound(id).into());
    }
    if state.registry().is_connected(&id).await? {
        state
            .reconciler
            .tell(Resync { machine_id: Some(id) })
            .await
            .map_err(|e| AppError::internal(e.to_string()))?;
    } else {
        state.sweeper.sync_machine(&id).await?;
    }
    Ok(Json(StatusResponse::ok()))
}
