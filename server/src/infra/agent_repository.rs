//! Cluster agent and agent config repository

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqliteConnection, SqlitePool, Transaction};

use super::sqlite::{parse_ts, ts};
use crate::domain::agent::{ClusterAgent, WorkspacesAgentConfig};
use crate::error::{Error, Result};

/// Database row for cluster agent
#[derive(Debug, FromRow)]
struct AgentRow {
    id: i64,
    name: String,
    created_at: String,
}

impl TryFrom<AgentRow> for ClusterAgent {
    type Error = Error;

    fn try_from(row: AgentRow) -> Result<Self> {
        Ok(ClusterAgent {
            id: row.id,
            name: row.name,
            created_at: parse_ts(&row.created_at, "created_at")?,
        })
    }
}

/// Database row for workspaces agent config
#[derive(Debug, FromRow)]
struct AgentConfigRow {
    cluster_agent_id: i64,
    enabled: bool,
    dns_zone: String,
    network_policy_enabled: bool,
    network_policy_egress: String,
    workspaces_quota: i64,
    workspaces_per_user_quota: i64,
    max_active_hours_before_stop: i64,
    max_stopped_hours_before_termination: i64,
    gitlab_workspaces_proxy_namespace: String,
    image_pull_secrets: String,
    default_resources_per_workspace_container: String,
    max_resources_per_workspace: String,
    labels: String,
    annotations: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<AgentConfigRow> for WorkspacesAgentConfig {
    type Error = Error;

    fn try_from(row: AgentConfigRow) -> Result<Self> {
        fn json<T: serde::de::DeserializeOwned>(value: &str, field: &str) -> Result<T> {
            serde_json::from_str(value)
                .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
        }

        Ok(WorkspacesAgentConfig {
            cluster_agent_id: row.cluster_agent_id,
            enabled: row.enabled,
            dns_zone: row.dns_zone,
            network_policy_enabled: row.network_policy_enabled,
            network_policy_egress: json(&row.network_policy_egress, "network_policy_egress")?,
            workspaces_quota: row.workspaces_quota,
            workspaces_per_user_quota: row.workspaces_per_user_quota,
            max_active_hours_before_stop: row.max_active_hours_before_stop,
            max_stopped_hours_before_termination: row.max_stopped_hours_before_termination,
            gitlab_workspaces_proxy_namespace: row.gitlab_workspaces_proxy_namespace,
            image_pull_secrets: json(&row.image_pull_secrets, "image_pull_secrets")?,
            default_resources_per_workspace_container: json(
                &row.default_resources_per_workspace_container,
                "default_resources_per_workspace_container",
            )?,
            max_resources_per_workspace: json(
                &row.max_resources_per_workspace,
                "max_resources_per_workspace",
            )?,
            labels: json(&row.labels, "labels")?,
            annotations: json(&row.annotations, "annotations")?,
            created_at: parse_ts(&row.created_at, "created_at")?,
            updated_at: parse_ts(&row.updated_at, "updated_at")?,
        })
    }
}

/// Repository for cluster agents and their workspaces config
pub struct AgentRepository {
    pool: SqlitePool,
}

impl AgentRepository {
    /// Create a new repository with the given pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Start a transaction for a config update
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Register an agent identified by the sha256 of its token
    pub async fn create(
        &self,
        name: &str,
        token_sha256: &str,
        now: DateTime<Utc>,
    ) -> Result<ClusterAgent> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM cluster_agents WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            return Err(Error::AgentAlreadyExists(name.to_string()));
        }

        let id = sqlx::query(
            r#"
            INSERT INTO cluster_agents (name, token_sha256, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(token_sha256)
        .bind(ts(now))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get(id).await
    }

    /// Get an agent by ID
    pub async fn get(&self, id: i64) -> Result<ClusterAgent> {
        let row: AgentRow =
            sqlx::query_as("SELECT id, name, created_at FROM cluster_agents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;

        row.try_into()
    }

    /// Look up the agent a token belongs to
    pub async fn find_by_token_hash(&self, token_sha256: &str) -> Result<Option<ClusterAgent>> {
        let row: Option<AgentRow> = sqlx::query_as(
            "SELECT id, name, created_at FROM cluster_agents WHERE token_sha256 = ?",
        )
        .bind(token_sha256)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// Get the workspaces config of an agent, if it ever reported one
    pub async fn find_config(&self, agent_id: i64) -> Result<Option<WorkspacesAgentConfig>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_config_in(&mut conn, agent_id).await
    }

    pub async fn find_config_in(
        conn: &mut SqliteConnection,
        agent_id: i64,
    ) -> Result<Option<WorkspacesAgentConfig>> {
        let row: Option<AgentConfigRow> = sqlx::query_as(
            r#"
            SELECT cluster_agent_id, enabled, dns_zone, network_policy_enabled, network_policy_egress,
                   workspaces_quota, workspaces_per_user_quota, max_active_hours_before_stop,
                   max_stopped_hours_before_termination, gitlab_workspaces_proxy_namespace,
                   image_pull_secrets, default_resources_per_workspace_container,
                   max_resources_per_workspace, labels, annotations, created_at, updated_at
            FROM workspaces_agent_configs
            WHERE cluster_agent_id = ?
            "#,
        )
        .bind(agent_id)
        .fetch_optional(conn)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// Insert or replace the config of an agent, keeping its creation time
    pub async fn upsert_config_in(
        conn: &mut SqliteConnection,
        config: &WorkspacesAgentConfig,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspaces_agent_configs (
                cluster_agent_id, enabled, dns_zone, network_policy_enabled, network_policy_egress,
                workspaces_quota, workspaces_per_user_quota, max_active_hours_before_stop,
                max_stopped_hours_before_termination, gitlab_workspaces_proxy_namespace,
                image_pull_secrets, default_resources_per_workspace_container,
                max_resources_per_workspace, labels, annotations, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(cluster_agent_id) DO UPDATE SET
                enabled = excluded.enabled,
                dns_zone = excluded.dns_zone,
                network_policy_enabled = excluded.network_policy_enabled,
                network_policy_egress = excluded.network_policy_egress,
                workspaces_quota = excluded.workspaces_quota,
                workspaces_per_user_quota = excluded.workspaces_per_user_quota,
                max_active_hours_before_stop = excluded.max_active_hours_before_stop,
                max_stopped_hours_before_termination = excluded.max_stopped_hours_before_termination,
                gitlab_workspaces_proxy_namespace = excluded.gitlab_workspaces_proxy_namespace,
                image_pull_secrets = excluded.image_pull_secrets,
                default_resources_per_workspace_container = excluded.default_resources_per_workspace_container,
                max_resources_per_workspace = excluded.max_resources_per_workspace,
                labels = excluded.labels,
                annotations = excluded.annotations,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(config.cluster_agent_id)
        .bind(config.enabled)
        .bind(&config.dns_zone)
        .bind(config.network_policy_enabled)
        .bind(serde_json::to_string(&config.network_policy_egress)?)
        .bind(config.workspaces_quota)
        .bind(config.workspaces_per_user_quota)
        .bind(config.max_active_hours_before_stop)
        .bind(config.max_stopped_hours_before_termination)
        .bind(&config.gitlab_workspaces_proxy_namespace)
        .bind(serde_json::to_string(&config.image_pull_secrets)?)
        .bind(serde_json::to_string(&config.default_resources_per_workspace_container)?)
        .bind(serde_json::to_string(&config.max_resources_per_workspace)?)
        .bind(serde_json::to_string(&config.labels)?)
        .bind(serde_json::to_string(&config.annotations)?)
        .bind(ts(config.created_at))
        .bind(ts(config.updated_at))
        .execute(conn)
        .await?;

        Ok(())
    }
}
