//! Workspace service

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::domain::agent::WorkspacesAgentConfig;
use crate::domain::devfile::{Devfile, ProjectSource};
use crate::domain::workspace::{
    CreateWorkspaceParams, DesiredState, NewWorkspace, Workspace, WorkspaceFilter,
    WorkspaceVariable,
};
use crate::error::{Error, Result};
use crate::infra::agent_repository::AgentRepository;
use crate::infra::clock::Clock;
use crate::infra::devfile_source::DevfileSource;
use crate::infra::workspace_repository::WorkspaceRepository;
use crate::service::desired_config::VARIABLES_FILE_DIR;
use crate::Config;

/// Port of the editor injected into the main container
const DEFAULT_EDITOR_PORT: i64 = 60001;
const NAME_SUFFIX_LEN: usize = 6;

const TOKEN_FILE: &str = "gl_token";
const CREDENTIAL_HELPER_FILE: &str = "gl_git_credential_store.sh";

const CREDENTIAL_HELPER_SCRIPT: &str = r#"#!/bin/sh
# Read-only credential helper: only answers "get"
if [ "$1" != "get" ]; then
  exit 0
fi
echo "username=oauth2"
echo "password=$(cat "${GL_TOKEN_FILE_PATH}")"
"#;

/// Workspace service for the user-facing control API
pub struct WorkspaceService {
    repository: Arc<WorkspaceRepository>,
    agents: Arc<AgentRepository>,
    devfile_source: Arc<dyn DevfileSource>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
}

impl WorkspaceService {
    /// Create a new workspace service
    pub fn new(
        repository: Arc<WorkspaceRepository>,
        agents: Arc<AgentRepository>,
        devfile_source: Arc<dyn DevfileSource>,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            agents,
            devfile_source,
            config,
            clock,
        }
    }

    /// Create a workspace; it starts with desired Running and is picked up
    /// by the agent's next poll
    pub async fn create(&self, params: CreateWorkspaceParams) -> Result<Workspace> {
        info!(
            agent_id = params.cluster_agent_id,
            user_id = params.user_id,
            project_id = %params.project_id,
            "Creating workspace"
        );

        if params.project_id.trim().is_empty() {
            return Err(Error::InvalidParameter("project_id is required".to_string()));
        }

        let agent = self.agents.get(params.cluster_agent_id).await?;
        let agent_config = self
            .agents
            .find_config(agent.id)
            .await?
            .ok_or(Error::AgentConfigNotFound(agent.id))?;
        if !agent_config.enabled {
            return Err(Error::AgentDisabled(agent.id));
        }
        self.check_quotas(&agent_config, params.user_id).await?;

        let max_hours = self.max_hours_before_termination(params.max_hours_before_termination)?;

        let content = match &params.devfile {
            Some(content) => content.clone(),
            None => {
                self.devfile_source
                    .fetch(&params.project_id, &params.project_ref, &params.devfile_path)
                    .await?
            }
        };
        let devfile = Devfile::parse(&content)?;
        devfile.validate()?;

        let processed = devfile.process(&ProjectSource {
            clone_url: self.config.clone_url(&params.project_id),
            project_ref: params.project_ref.clone(),
            project_name: project_name(&params.project_id).to_string(),
        });

        let suffix: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(NAME_SUFFIX_LEN)
            .collect();
        let name = format!("workspace-{}-{}-{}", agent.id, params.user_id, suffix);
        let namespace = format!("gl-rd-ns-{}-{}-{}", agent.id, params.user_id, suffix);
        let url = format!(
            "https://{}-{}.{}",
            editor_port(&processed),
            name,
            agent_config.dns_zone
        );

        let mut variables = self.internal_variables(&name, &agent_config);
        append_user_variables(&mut variables, params.variables)?;

        let new = NewWorkspace {
            cluster_agent_id: agent.id,
            user_id: params.user_id,
            project_id: params.project_id,
            project_ref: params.project_ref,
            devfile_path: params.devfile_path,
            name,
            namespace,
            devfile: content,
            processed_devfile: processed.to_yaml()?,
            url,
            max_hours_before_termination: max_hours,
            variables,
        };

        let workspace = self.repository.create(new, self.clock.now()).await?;
        info!(
            workspace_id = workspace.id,
            name = %workspace.name,
            "Workspace created"
        );
        Ok(workspace)
    }

    /// Check that workspace storage is reachable
    pub async fn ping(&self) -> Result<()> {
        self.repository.ping().await
    }

    /// Get a workspace by ID
    pub async fn get(&self, id: i64) -> Result<Workspace> {
        self.repository.get(id).await
    }

    /// List workspaces, optionally filtered by agent and user
    pub async fn list(&self, filter: &WorkspaceFilter) -> Result<Vec<Workspace>> {
        self.repository.list(filter).await
    }

    /// Change what the user wants the workspace to be
    pub async fn update_desired_state(&self, id: i64, state: DesiredState) -> Result<Workspace> {
        let workspace = self.repository.get(id).await?;

        if workspace.desired_state == state {
            return Ok(workspace);
        }
        if !workspace.desired_state.can_change_to(state) {
            return Err(Error::InvalidDesiredState {
                from: workspace.desired_state.as_str().to_string(),
                to: state.as_str().to_string(),
            });
        }

        let updated = self
            .repository
            .update_desired_state(id, state, self.clock.now())
            .await?;
        info!(
            workspace_id = id,
            from = workspace.desired_state.as_str(),
            to = state.as_str(),
            "Desired state updated"
        );
        Ok(updated)
    }

    async fn check_quotas(&self, agent_config: &WorkspacesAgentConfig, user_id: i64) -> Result<()> {
        let agent_id = agent_config.cluster_agent_id;

        let total = self.repository.count_active(agent_id, None).await?;
        if !WorkspacesAgentConfig::allows_another(agent_config.workspaces_quota, total) {
            return Err(Error::QuotaExceeded(format!(
                "agent {} already runs {} of {} workspaces",
                agent_id, total, agent_config.workspaces_quota
            )));
        }

        let per_user = self.repository.count_active(agent_id, Some(user_id)).await?;
        if !WorkspacesAgentConfig::allows_another(agent_config.workspaces_per_user_quota, per_user) {
            return Err(Error::QuotaExceeded(format!(
                "user {} already has {} of {} workspaces on agent {}",
                user_id, per_user, agent_config.workspaces_per_user_quota, agent_id
            )));
        }

        Ok(())
    }

    fn max_hours_before_termination(&self, requested: Option<i64>) -> Result<i64> {
        let hours = requested.unwrap_or(self.config.default_max_hours_before_termination);
        if hours <= 0 || hours > self.config.max_hours_before_termination_limit {
            return Err(Error::InvalidParameter(format!(
                "max_hours_before_termination must be between 1 and {}",
                self.config.max_hours_before_termination_limit
            )));
        }
        Ok(hours)
    }

    /// Variables every workspace gets: its own name and domain, an API token
    /// and a git credential helper reading that token
    fn internal_variables(
        &self,
        name: &str,
        agent_config: &WorkspacesAgentConfig,
    ) -> Vec<WorkspaceVariable> {
        let token_path = format!("{}/{}", VARIABLES_FILE_DIR, TOKEN_FILE);
        let helper_path = format!("{}/{}", VARIABLES_FILE_DIR, CREDENTIAL_HELPER_FILE);
        let token = format!("glpat-{}", Uuid::new_v4().simple());

        vec![
            WorkspaceVariable::environment(
                "GL_WORKSPACE_DOMAIN_TEMPLATE",
                format!("${{PORT}}-{}.{}", name, agent_config.dns_zone),
            ),
            WorkspaceVariable::environment("GL_WORKSPACE_NAME", name),
            WorkspaceVariable::environment("GL_TOKEN_FILE_PATH", token_path.clone()),
            WorkspaceVariable::environment("GL_GIT_CREDENTIAL_STORE_FILE_PATH", helper_path.clone()),
            WorkspaceVariable::environment("GIT_CONFIG_COUNT", "1"),
            WorkspaceVariable::environment("GIT_CONFIG_KEY_0", "credential.helper"),
            WorkspaceVariable::environment("GIT_CONFIG_VALUE_0", helper_path),
            WorkspaceVariable::environment("GITLAB_WORKFLOW_INSTANCE_URL", self.config.gitlab_url.clone()),
            WorkspaceVariable::environment("GITLAB_WORKFLOW_TOKEN_FILE", token_path),
            WorkspaceVariable::file(TOKEN_FILE, token),
            WorkspaceVariable::file(CREDENTIAL_HELPER_FILE, CREDENTIAL_HELPER_SCRIPT),
        ]
    }
}

fn append_user_variables(
    variables: &mut Vec<WorkspaceVariable>,
    user_variables: Vec<WorkspaceVariable>,
) -> Result<()> {
    let mut taken: HashSet<String> = variables.iter().map(|v| v.key.clone()).collect();
    for mut variable in user_variables {
        if variable.key.trim().is_empty() {
            return Err(Error::InvalidParameter(
                "variable key must not be empty".to_string(),
            ));
        }
        if !taken.insert(variable.key.clone()) {
            return Err(Error::InvalidParameter(format!(
                "variable '{}' is reserved or duplicated",
                variable.key
            )));
        }
        variable.user_provided = true;
        variables.push(variable);
    }
    Ok(())
}

/// Last path segment of a project path, used as the checkout directory
fn project_name(project_id: &str) -> &str {
    project_id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(project_id)
}

/// First endpoint of the main container, else the injected editor port
fn editor_port(devfile: &Devfile) -> i64 {
    let main = devfile.main_component_name();
    devfile
        .components
        .iter()
        .filter(|c| Some(c.name.as_str()) == main)
        .filter_map(|c| c.container.as_ref())
        .flat_map(|c| c.endpoints.iter())
        .map(|e| e.target_port)
        .next()
        .unwrap_or(DEFAULT_EDITOR_PORT)
}
