//! Workspace HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::domain::workspace::{
    ActualState, CreateWorkspaceParams, DesiredState, Workspace, WorkspaceFilter,
};
use crate::{AppState, Result};

// ==================== Request/Response Types ====================

/// Update workspace request
#[derive(Debug, Deserialize)]
pub struct UpdateWorkspaceRequest {
    pub desired_state: DesiredState,
}

/// Workspace response
#[derive(Debug, Serialize)]
pub struct WorkspaceResponse {
    pub id: i64,
    pub cluster_agent_id: i64,
    pub user_id: i64,
    pub project_id: String,
    pub project_ref: String,
    pub name: String,
    pub namespace: String,
    pub url: String,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub deployment_resource_version: Option<String>,
    pub max_hours_before_termination: i64,
    pub desired_state_updated_at: String,
    pub responded_to_agent_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Workspace> for WorkspaceResponse {
    fn from(w: Workspace) -> Self {
        Self {
            id: w.id,
            cluster_agent_id: w.cluster_agent_id,
            user_id: w.user_id,
            project_id: w.project_id,
            project_ref: w.project_ref,
            name: w.name,
            namespace: w.namespace,
            url: w.url,
            desired_state: w.desired_state,
            actual_state: w.actual_state,
            deployment_resource_version: w.deployment_resource_version,
            max_hours_before_termination: w.max_hours_before_termination,
            desired_state_updated_at: w.desired_state_updated_at.to_rfc3339(),
            responded_to_agent_at: w.responded_to_agent_at.map(|t| t.to_rfc3339()),
            created_at: w.created_at.to_rfc3339(),
            updated_at: w.updated_at.to_rfc3339(),
        }
    }
}

/// List workspaces response
#[derive(Debug, Serialize)]
pub struct ListWorkspacesResponse {
    pub workspaces: Vec<WorkspaceResponse>,
    pub total: usize,
}

// ==================== Handlers ====================

/// Create a new workspace
pub async fn create_workspace(
    State(state): State<AppState>,
    Json(params): Json<CreateWorkspaceParams>,
) -> Result<(StatusCode, Json<WorkspaceResponse>)> {
    let workspace = state.workspace_service.create(params).await?;
    Ok((StatusCode::CREATED, Json(workspace.into())))
}

/// Get a workspace by ID
pub async fn get_workspace(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<WorkspaceResponse>> {
    let workspace = state.workspace_service.get(id).await?;
    Ok(Json(workspace.into()))
}

/// List workspaces, filtered by `agent_id` and `user_id`
pub async fn list_workspaces(
    State(state): State<AppState>,
    Query(filter): Query<WorkspaceFilter>,
) -> Result<Json<ListWorkspacesResponse>> {
    let workspaces = state.workspace_service.list(&filter).await?;
    let total = workspaces.len();

    Ok(Json(ListWorkspacesResponse {
        workspaces: workspaces.into_iter().map(Into::into).collect(),
        total,
    }))
}

/// Change the desired state of a workspace
pub async fn update_workspace(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateWorkspaceRequest>,
) -> Result<Json<WorkspaceResponse>> {
    let workspace = state
        .workspace_service
        .update_desired_state(id, req.desired_state)
        .await?;
    Ok(Json(workspace.into()))
}
