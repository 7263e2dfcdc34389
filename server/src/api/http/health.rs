//! Health check handler

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{AppState, Result};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Report liveness; fails when the database is unreachable
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    state.workspace_service.ping().await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
