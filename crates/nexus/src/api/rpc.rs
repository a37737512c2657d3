//! Agent bearer token endpoints

use std::sync::Arc;

use axum::{Json, extract::State};
use nexus_api::responses::TokenResponse;
use tracing::info;

use crate::api::error::AppError;
use crate::state::AppState;

/// # Errors
/// Returns error if the token file cannot be read
pub async fn token(State(state): State<Arc<AppState>>) -> Result<Json<TokenResponse>, AppError> {
    Ok(Json(TokenResponse {
        token: state.tokens.current()?,
    }))
}

/// Issue a new token; the previous one stays valid until a token sweep succeeds
///
/// # Errors
/// Returns error if the token file cannot be written
pub async fn rotate_token(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TokenResponse>, AppError> {
    let token = state.tokens.rotate()?;
    info!("agent token rotated");
    Ok(Json(TokenResponse { token }))
}
