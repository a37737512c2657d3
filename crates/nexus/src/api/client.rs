//! Agent-port bootstrap and connection lookup endpoints

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use nexus_api::responses::MachineResponse;
use nexus_core::Machine;
use tracing::debug;

use crate::api::error::AppError;
use crate::state::AppState;

pub(crate) fn machine_response(machine: Machine) -> MachineResponse {
    MachineResponse {
        id: machine.id,
        name: machine.name,
        host: machine.host,
        port: machine.port,
        uuid: machine.uuid,
        connected: machine.connected,
        last_error: machine.last_error,
    }
}

/// Certificates agents pin before opening the stream
///
/// # Errors
/// Returns error if the certificate cannot be read
pub async fn ca_cert(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let pem = state.tls.trust_bundle()?;
    debug!(mode = ?state.tls.mode(), "serving trust bundle");
    Ok(([(header::CONTENT_TYPE, "application/x-pem-file")], pem))
}

/// Record of a machine with a live stream
///
/// # Errors
/// Returns 404 if the machine has no live stream
pub async fn client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MachineResponse>, AppError> {
    if !state.registry().is_connected(&id).await? {
        return Err(AppError::not_found(format!("client not connected: {id}")));
    }
    let machine = state
        .store()
        .machine(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("machine not found: {id}")))?;
    Ok(Json(machine_response(machine)))
}

/// # Errors
/// Returns 404 if the machine has no live stream
pub async fn client_health(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<&'static str, AppError> {
    if state.registry().is_connected(&id).await? {
        Ok("OK")
    } else {
        Err(AppError::not_found(format!("client not connected: {id}")))
    }
}
