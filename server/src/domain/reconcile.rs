//! Reconciliation protocol wire types

use serde::{Deserialize, Serialize};

use super::workspace::{ActualState, DesiredState};

/// Kind of poll sent by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    /// Frequent poll; only workspaces with news are returned
    Partial,
    /// Periodic sweep; every non-terminated workspace is returned with its config
    Full,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Partial => "partial",
            UpdateType::Full => "full",
        }
    }
}

/// Progress of a workspace teardown as seen by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationProgress {
    Terminating,
    Terminated,
}

/// Failure the agent hit while applying a config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub error_type: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// State of one workspace as reported by the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceAgentInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,

    /// Explicit state, when the agent already knows it
    #[serde(default)]
    pub actual_state: Option<ActualState>,

    #[serde(default)]
    pub deployment_resource_version: Option<String>,

    #[serde(default)]
    pub termination_progress: Option<TerminationProgress>,

    /// Raw Kubernetes Deployment object, used to derive the state
    #[serde(default)]
    pub latest_k8s_deployment_info: Option<serde_json::Value>,

    #[serde(default)]
    pub error_details: Option<ErrorDetails>,

    /// Whether any of the workspace's resources still exist in the cluster
    #[serde(default)]
    pub resources_present: Option<bool>,
}

/// Body of a reconcile request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub update_type: UpdateType,
    #[serde(default)]
    pub workspace_agent_infos: Vec<WorkspaceAgentInfo>,
}

/// What the control plane tells the agent about one workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRailsInfo {
    pub name: String,
    pub namespace: String,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub deployment_resource_version: Option<String>,

    /// Multi-document Kubernetes YAML, present only when the agent must apply it
    pub config_to_apply: Option<String>,
}

/// Scheduling hints returned with every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSettings {
    pub partial_reconciliation_interval_seconds: u64,
    pub full_reconciliation_interval_seconds: u64,
}

/// Body of a reconcile response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub workspace_rails_infos: Vec<WorkspaceRailsInfo>,
    pub settings: ReconcileSettings,
}
