//! ACME HTTP-01 challenge responder

use axum::extract::{Path, State};
use nexus_ca::ChallengeMap;

use crate::api::error::AppError;

/// Key authorization for a pending challenge `token`
///
/// # Errors
/// Returns 404 if no challenge is pending for `token`
pub async fn challenge(
    State(challenges): State<ChallengeMap>,
    Path(token): Path<String>,
) -> Result<String, AppError> {
    challenges
        .read()
        .await
        .get(&token)
        .cloned()
        .ok_or_else(|| AppError::not_found("unknown challenge"))
}
