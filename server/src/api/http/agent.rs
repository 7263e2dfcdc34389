//! Agent-facing HTTP handlers

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentConfigurationRequest, ClusterAgent};
use crate::domain::reconcile::{ReconcileRequest, ReconcileResponse};
use crate::error::Error;
use crate::{AppState, Result};

/// Agent resolved from the bearer token of the request
pub struct AuthenticatedAgent(pub ClusterAgent);

impl FromRequestParts<AppState> for AuthenticatedAgent {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| Error::Unauthorized("missing bearer token".to_string()))?;

        let agent = state.agent_service.authenticate(bearer.token()).await?;
        Ok(Self(agent))
    }
}

/// Register agent request
#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub name: String,
}

/// Register agent response; the token is never returned again
#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    pub id: i64,
    pub name: String,
    pub token: String,
    pub created_at: String,
}

/// Answer an agent poll
pub async fn reconcile(
    State(state): State<AppState>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Json(req): Json<ReconcileRequest>,
) -> Result<(StatusCode, Json<ReconcileResponse>)> {
    let response = state.reconcile_service.reconcile(&agent, req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Store the workspaces config reported by an agent
pub async fn agent_configuration(
    State(state): State<AppState>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Json(req): Json<AgentConfigurationRequest>,
) -> Result<StatusCode> {
    state
        .agent_service
        .configure(&agent, req.remote_development)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Register a new agent
pub async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<(StatusCode, Json<RegisterAgentResponse>)> {
    let registered = state.agent_service.register(&req.name).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterAgentResponse {
            id: registered.agent.id,
            name: registered.agent.name,
            token: registered.token,
            created_at: registered.agent.created_at.to_rfc3339(),
        }),
    ))
}
