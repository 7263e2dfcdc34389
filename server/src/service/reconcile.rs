//! Reconciliation service
//!
//! Handles one agent poll: records what the agent reports, applies the
//! time-based lifecycle policy, and answers with the workspaces the agent
//! has to act on. Everything a poll writes is committed together, and only
//! once the response has been built, so a failed poll never advances
//! `responded_to_agent_at`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::domain::agent::{ClusterAgent, WorkspacesAgentConfig};
use crate::domain::reconcile::{
    ReconcileRequest, ReconcileResponse, ReconcileSettings, UpdateType, WorkspaceAgentInfo,
    WorkspaceRailsInfo,
};
use crate::domain::schedule::lifecycle_transition;
use crate::domain::state::{
    apply_reported_state, calculate_actual_state, requires_config_apply, ActualStateUpdate,
};
use crate::domain::workspace::{ActualState, Workspace};
use crate::error::{Error, Result};
use crate::infra::agent_repository::AgentRepository;
use crate::infra::clock::Clock;
use crate::infra::workspace_repository::WorkspaceRepository;
use crate::service::desired_config::{self, ConfigInput};
use crate::Config;

/// Reconciliation service answering agent polls
pub struct ReconcileService {
    workspaces: Arc<WorkspaceRepository>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
}

impl ReconcileService {
    /// Create a new reconciliation service
    pub fn new(
        workspaces: Arc<WorkspaceRepository>,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workspaces,
            config,
            clock,
        }
    }

    /// Run one reconciliation cycle for `agent`
    pub async fn reconcile(
        &self,
        agent: &ClusterAgent,
        request: ReconcileRequest,
    ) -> Result<ReconcileResponse> {
        let now = self.clock.now();
        let update_type = request.update_type;
        let mut tx = self.workspaces.begin().await?;

        let agent_config = AgentRepository::find_config_in(&mut tx, agent.id).await?;

        let mut reported = Vec::new();
        for info in &request.workspace_agent_infos {
            match apply_agent_info(&mut tx, agent.id, info, now).await {
                Ok(name) => reported.push(name),
                Err(e @ (Error::UnknownWorkspace(_) | Error::InvalidAgentInfo(_))) => {
                    warn!(agent_id = agent.id, code = e.code(), "Skipping agent info: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(agent_config) = &agent_config {
            apply_lifecycle_policy(&mut tx, agent.id, agent_config, now).await?;
        }

        let selected = select_workspaces(&mut tx, agent.id, update_type, &reported).await?;

        let mut infos = Vec::with_capacity(selected.len());
        for workspace in &selected {
            let config_to_apply = if requires_config_apply(update_type, workspace) {
                render_config(&mut tx, workspace, agent_config.as_ref()).await?
            } else {
                None
            };

            infos.push(WorkspaceRailsInfo {
                name: workspace.name.clone(),
                namespace: workspace.namespace.clone(),
                desired_state: workspace.desired_state,
                actual_state: workspace.actual_state,
                deployment_resource_version: workspace.deployment_resource_version.clone(),
                config_to_apply,
            });
        }

        let ids: Vec<i64> = selected.iter().map(|w| w.id).collect();
        WorkspaceRepository::mark_responded_in(&mut tx, &ids, now).await?;
        tx.commit().await?;

        info!(
            agent_id = agent.id,
            update_type = update_type.as_str(),
            reported = request.workspace_agent_infos.len(),
            returned = infos.len(),
            with_config = infos.iter().filter(|i| i.config_to_apply.is_some()).count(),
            "Reconciliation completed"
        );

        Ok(ReconcileResponse {
            workspace_rails_infos: infos,
            settings: ReconcileSettings::from_config(&self.config),
        })
    }
}

/// Record one agent report; returns the name of the workspace it was for
async fn apply_agent_info(
    conn: &mut SqliteConnection,
    agent_id: i64,
    info: &WorkspaceAgentInfo,
    now: DateTime<Utc>,
) -> Result<String> {
    let (Some(name), Some(namespace)) = (info.name.as_deref(), info.namespace.as_deref()) else {
        return Err(Error::InvalidAgentInfo(
            "name and namespace are required".to_string(),
        ));
    };

    let workspace = WorkspaceRepository::find_by_name_in(conn, agent_id, name)
        .await?
        .filter(|w| w.namespace == namespace)
        .ok_or_else(|| Error::UnknownWorkspace(format!("{}/{}", namespace, name)))?;

    if let Some(details) = &info.error_details {
        warn!(
            workspace_id = workspace.id,
            error_type = %details.error_type,
            "Agent failed to apply config: {}",
            details.error_message.as_deref().unwrap_or("no message")
        );
    }

    let Some(reported) = calculate_actual_state(info, workspace.desired_state) else {
        debug!(workspace_id = workspace.id, "Agent info carries no state");
        return Ok(workspace.name);
    };

    let state = match apply_reported_state(workspace.actual_state, reported) {
        ActualStateUpdate::Accepted(state) => state,
        ActualStateUpdate::OutOfOrder(state) => {
            warn!(
                workspace_id = workspace.id,
                from = workspace.actual_state.as_str(),
                to = state.as_str(),
                "Out of order actual state report, applying anyway"
            );
            state
        }
        ActualStateUpdate::Absorbed => {
            debug!(
                workspace_id = workspace.id,
                reported = reported.as_str(),
                "Ignoring report for terminated workspace"
            );
            return Ok(workspace.name);
        }
    };

    let resource_version = match state {
        ActualState::Terminating | ActualState::Terminated => None,
        _ => info
            .deployment_resource_version
            .as_deref()
            .or(workspace.deployment_resource_version.as_deref()),
    };

    WorkspaceRepository::update_actual_state_in(conn, workspace.id, state, resource_version, now)
        .await?;

    if state != workspace.actual_state {
        info!(
            workspace_id = workspace.id,
            from = workspace.actual_state.as_str(),
            to = state.as_str(),
            "Actual state changed"
        );
    }

    Ok(workspace.name)
}

/// Stop idle workspaces and terminate expired ones
async fn apply_lifecycle_policy(
    conn: &mut SqliteConnection,
    agent_id: i64,
    agent_config: &WorkspacesAgentConfig,
    now: DateTime<Utc>,
) -> Result<()> {
    let workspaces = WorkspaceRepository::list_active_for_agent_in(conn, agent_id).await?;
    for workspace in workspaces {
        if let Some(next) = lifecycle_transition(&workspace, agent_config, now) {
            WorkspaceRepository::update_desired_state_in(conn, workspace.id, next, now).await?;
            info!(
                workspace_id = workspace.id,
                from = workspace.desired_state.as_str(),
                to = next.as_str(),
                "Desired state changed by lifecycle policy"
            );
        }
    }
    Ok(())
}

/// Workspaces to include in the response, ordered by id
async fn select_workspaces(
    conn: &mut SqliteConnection,
    agent_id: i64,
    update_type: UpdateType,
    reported: &[String],
) -> Result<Vec<Workspace>> {
    let base = match update_type {
        UpdateType::Partial => {
            WorkspaceRepository::list_desired_state_updated_in(conn, agent_id).await?
        }
        UpdateType::Full => WorkspaceRepository::list_active_for_agent_in(conn, agent_id).await?,
    };

    let mut selected: BTreeMap<i64, Workspace> = base.into_iter().map(|w| (w.id, w)).collect();
    for name in reported {
        if selected.values().any(|w| &w.name == name) {
            continue;
        }
        if let Some(workspace) = WorkspaceRepository::find_by_name_in(conn, agent_id, name).await? {
            selected.insert(workspace.id, workspace);
        }
    }

    Ok(selected.into_values().collect())
}

async fn render_config(
    conn: &mut SqliteConnection,
    workspace: &Workspace,
    agent_config: Option<&WorkspacesAgentConfig>,
) -> Result<Option<String>> {
    let Some(agent_config) = agent_config else {
        warn!(
            workspace_id = workspace.id,
            "No workspaces config for agent, cannot render config"
        );
        return Ok(None);
    };

    let variables = WorkspaceRepository::variables_in(conn, workspace.id).await?;
    let yaml = desired_config::generate(&ConfigInput {
        workspace,
        agent_config,
        variables: &variables,
    })?;
    Ok(Some(yaml))
}
