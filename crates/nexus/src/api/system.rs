//! Liveness and version endpoints

use axum::Json;
use nexus_api::responses::{HealthResponse, VersionResponse};

/// Plain-text liveness probe on the agent port
pub async fn health() -> &'static str {
    "OK"
}

/// Plain-text daemon version on the agent port
pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub async fn api_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub async fn api_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
