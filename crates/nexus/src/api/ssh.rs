//! Certificate authority endpoints

use std::sync::Arc;
use std::time::Duration;

use axum::{Json, extract::State};
use nexus_api::requests::{SetUserCaRequest, SignHostRequest, SignUserRequest};
use nexus_api::responses::{CertificateResponse, KeyResponse, StatusResponse};
use nexus_ca::sign::{DEFAULT_PRINCIPAL, SignedCertificate};
use nexus_core::{CoreError, Resync};
use tracing::{info, warn};

use crate::api::error::AppError;
use crate::state::AppState;

fn certificate(signed: SignedCertificate) -> Json<CertificateResponse> {
    Json(CertificateResponse {
        certificate: signed.certificate,
        expiry: signed.expiry,
    })
}

/// Sign a user key for the user's principal, or for `root` when no user is named
///
/// # Errors
/// Returns 404 for an unknown user and 400 for an unparsable key
pub async fn sign_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignUserRequest>,
) -> Result<Json<CertificateResponse>, AppError> {
    let principal = match &req.user_id {
        Some(id) => state
            .store()
            .user(id)
            .await?
            .ok_or_else(|| CoreError::UserNotFound(id.clone()))?
            .principal,
        None => DEFAULT_PRINCIPAL.to_string(),
    };
    let ttl = state
        .store()
        .settings()
        .await?
        .user_policy()
        .lease(req.ttl.map(Duration::from_secs));

    let signed = state.ca.sign_user(&req.public_key, &principal, ttl)?;
    info!(user = ?req.user_id, expiry = signed.expiry, "issued user certificate");
    Ok(certificate(signed))
}

/// # Errors
/// Returns 400 for an unparsable key
pub async fn sign_host(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignHostRequest>,
) -> Result<Json<CertificateResponse>, AppError> {
    let ttl = state
        .store()
        .settings()
        .await?
        .host_policy()
        .lease(req.ttl.map(Duration::from_secs));

    let signed = state.ca.sign_host(&req.public_key, &req.hostname, ttl)?;
    info!(hostname = %req.hostname, expiry = signed.expiry, "issued host certificate");
    Ok(certificate(signed))
}

/// # Errors
/// Returns error if the key cannot be read
pub async fn user_public_key(
    State(state): State<Arc<AppState>>,
) -> Result<Json<KeyResponse>, AppError> {
    Ok(Json(KeyResponse {
        key: state.ca.user_ca_public_key()?,
    }))
}

/// # Errors
/// Returns error if the key cannot be read
pub async fn host_public_key(
    State(state): State<Arc<AppState>>,
) -> Result<Json<KeyResponse>, AppError> {
    Ok(Json(KeyResponse {
        key: state.ca.host_ca_public_key()?,
    }))
}

/// Replace both signing keys and redistribute trust material fleet-wide
///
/// # Errors
/// Returns error if the new keys cannot be written
pub async fn rotate(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    state.ca.rotate_signing_keys()?;
    redistribute(&state).await?;
    Ok(Json(StatusResponse::ok()))
}

/// Import an operator supplied user CA key
///
/// # Errors
/// Returns 400 if the key cannot be parsed
pub async fn set_user_ca(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetUserCaRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    state.ca.import_user_ca(&req.key)?;
    redistribute(&state).await?;
    Ok(Json(StatusResponse::ok()))
}

/// Drop live streams so agents reconnect and receive the new keys, then converge the rest
async fn redistribute(state: &AppState) -> Result<(), AppError> {
    let connected = state.registry().connected_ids().await?;
    for id in &connected {
        state.registry().disconnect(id).await?;
    }
    info!(disconnected = connected.len(), "signing keys changed, redistributing");

    if let Err(e) = state.reconciler.tell(Resync { machine_id: None }).await {
        warn!(error = %e, "could not schedule fleet resync");
    }
    Ok(())
}
