//! Bearer authentication for the admin API

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use nexus_ca::tokens_match;

use crate::api::error::AppError;
use crate::state::AppState;

/// Reject requests whose bearer token differs from `admin_token`
///
/// Without a configured token every request is rejected.
///
/// # Errors
/// Returns 401 for a missing or wrong token
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.daemon.admin_token.as_deref() else {
        return Err(AppError::unauthorized("admin API has no token configured"));
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(presented) if !expected.is_empty() && tokens_match(expected, presented) => {
            Ok(next.run(request).await)
        }
        _ => Err(AppError::unauthorized("invalid admin token")),
    }
}
