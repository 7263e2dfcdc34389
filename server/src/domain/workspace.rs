//! Workspace domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State a user wants the workspace to be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredState {
    Running,
    Stopped,
    Terminated,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "Running",
            DesiredState::Stopped => "Stopped",
            DesiredState::Terminated => "Terminated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(DesiredState::Running),
            "Stopped" => Some(DesiredState::Stopped),
            "Terminated" => Some(DesiredState::Terminated),
            _ => None,
        }
    }
}

/// State of the workspace as last observed by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActualState {
    /// Created in the control plane, nothing reported by the agent yet
    CreationRequested,
    Starting,
    Running,
    Stopping,
    Stopped,
    Terminating,
    /// Absorbing: no report can move a workspace out of this state
    Terminated,
    /// The deployment failed to progress
    Failed,
    /// The agent failed to apply the config
    Error,
    /// The agent reported something the calculator cannot classify
    Unknown,
}

impl ActualState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActualState::CreationRequested => "CreationRequested",
            ActualState::Starting => "Starting",
            ActualState::Running => "Running",
            ActualState::Stopping => "Stopping",
            ActualState::Stopped => "Stopped",
            ActualState::Terminating => "Terminating",
            ActualState::Terminated => "Terminated",
            ActualState::Failed => "Failed",
            ActualState::Error => "Error",
            ActualState::Unknown => "Unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CreationRequested" => Some(ActualState::CreationRequested),
            "Starting" => Some(ActualState::Starting),
            "Running" => Some(ActualState::Running),
            "Stopping" => Some(ActualState::Stopping),
            "Stopped" => Some(ActualState::Stopped),
            "Terminating" => Some(ActualState::Terminating),
            "Terminated" => Some(ActualState::Terminated),
            "Failed" => Some(ActualState::Failed),
            "Error" => Some(ActualState::Error),
            "Unknown" => Some(ActualState::Unknown),
            _ => None,
        }
    }
}

/// How a variable is exposed inside the workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    /// Injected as an environment variable
    Environment,
    /// Mounted as a file under the variables directory
    File,
}

impl VariableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::Environment => "environment",
            VariableType::File => "file",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "environment" => Some(VariableType::Environment),
            "file" => Some(VariableType::File),
            _ => None,
        }
    }
}

/// A single workspace variable, either internal or user provided
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceVariable {
    pub key: String,
    pub variable_type: VariableType,
    pub value: String,
    #[serde(default)]
    pub user_provided: bool,
}

impl WorkspaceVariable {
    pub fn environment(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            variable_type: VariableType::Environment,
            value: value.into(),
            user_provided: false,
        }
    }

    pub fn file(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            variable_type: VariableType::File,
            value: value.into(),
            user_provided: false,
        }
    }
}

/// Workspace entity
///
/// One per provisioned remote development environment. Rows are never
/// deleted; `Terminated` is the terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub cluster_agent_id: i64,
    pub user_id: i64,

    /// Source project path, ref and devfile location
    pub project_id: String,
    pub project_ref: String,
    pub devfile_path: String,

    pub name: String,
    pub namespace: String,

    pub desired_state: DesiredState,
    pub actual_state: ActualState,

    /// Set whenever `desired_state` changes; drives partial reconciliation
    pub desired_state_updated_at: DateTime<Utc>,

    /// Last time this workspace was included in a reconciliation response
    pub responded_to_agent_at: Option<DateTime<Utc>>,

    /// Last resource version of the deployment reported by the agent
    pub deployment_resource_version: Option<String>,

    /// Raw devfile as fetched from the project
    pub devfile: String,

    /// Devfile with injected components, used to render the config
    pub processed_devfile: String,

    pub url: String,
    pub max_hours_before_termination: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// Check if the workspace has reached its terminal state
    pub fn is_terminated(&self) -> bool {
        self.actual_state == ActualState::Terminated
    }
}

#[cfg(test)]
impl Workspace {
    /// Freshly created workspace owned by agent 1 and user 1
    pub fn fixture(created_at: DateTime<Utc>) -> Self {
        Self {
            id: 1,
            cluster_agent_id: 1,
            user_id: 1,
            project_id: "group/project".to_string(),
            project_ref: "main".to_string(),
            devfile_path: ".devfile.yaml".to_string(),
            name: "workspace-1-1-abcdef".to_string(),
            namespace: "gl-rd-ns-1-1-abcdef".to_string(),
            desired_state: DesiredState::Running,
            actual_state: ActualState::CreationRequested,
            desired_state_updated_at: created_at,
            responded_to_agent_at: None,
            deployment_resource_version: None,
            devfile: String::new(),
            processed_devfile: String::new(),
            url: "https://60001-workspace-1-1-abcdef.workspaces.localdev.me".to_string(),
            max_hours_before_termination: 120,
            created_at,
            updated_at: created_at,
        }
    }
}

/// Parameters for creating a workspace
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkspaceParams {
    pub cluster_agent_id: i64,
    pub user_id: i64,
    pub project_id: String,
    #[serde(default = "default_project_ref")]
    pub project_ref: String,
    #[serde(default = "default_devfile_path")]
    pub devfile_path: String,

    /// Inline devfile content; fetched from the project when absent
    #[serde(default)]
    pub devfile: Option<String>,

    #[serde(default)]
    pub max_hours_before_termination: Option<i64>,

    #[serde(default)]
    pub variables: Vec<WorkspaceVariable>,
}

fn default_project_ref() -> String {
    "main".to_string()
}

fn default_devfile_path() -> String {
    ".devfile.yaml".to_string()
}

/// Fully resolved row to insert, produced by the workspace service
#[derive(Debug, Clone)]
pub struct NewWorkspace {
    pub cluster_agent_id: i64,
    pub user_id: i64,
    pub project_id: String,
    pub project_ref: String,
    pub devfile_path: String,
    pub name: String,
    pub namespace: String,
    pub devfile: String,
    pub processed_devfile: String,
    pub url: String,
    pub max_hours_before_termination: i64,
    pub variables: Vec<WorkspaceVariable>,
}

/// Filter for listing workspaces
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspaceFilter {
    pub agent_id: Option<i64>,
    pub user_id: Option<i64>,
}
