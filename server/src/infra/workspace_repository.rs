//! Workspace repository for database operations
//!
//! Reconciliation reads and writes go through a caller-provided connection
//! so one poll can run inside a single transaction; control API operations
//! use the pool directly.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqliteConnection, SqlitePool, Transaction};

use super::sqlite::{parse_ts, ts};
use crate::domain::workspace::{
    ActualState, DesiredState, NewWorkspace, VariableType, Workspace, WorkspaceFilter,
    WorkspaceVariable,
};
use crate::error::{Error, Result};

const WORKSPACE_COLUMNS: &str = r#"
    id, cluster_agent_id, user_id, project_id, project_ref, devfile_path, name, namespace,
    desired_state, actual_state, desired_state_updated_at, responded_to_agent_at,
    deployment_resource_version, devfile, processed_devfile, url, max_hours_before_termination,
    created_at, updated_at
"#;

/// Database row for workspace
#[derive(Debug, FromRow)]
struct WorkspaceRow {
    id: i64,
    cluster_agent_id: i64,
    user_id: i64,
    project_id: String,
    project_ref: String,
    devfile_path: String,
    name: String,
    namespace: String,
    desired_state: String,
    actual_state: String,
    desired_state_updated_at: String,
    responded_to_agent_at: Option<String>,
    deployment_resource_version: Option<String>,
    devfile: String,
    processed_devfile: String,
    url: String,
    max_hours_before_termination: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = Error;

    fn try_from(row: WorkspaceRow) -> Result<Self> {
        let desired_state = DesiredState::from_str(&row.desired_state).ok_or_else(|| {
            Error::Internal(format!("Invalid desired state: {}", row.desired_state))
        })?;
        let actual_state = ActualState::from_str(&row.actual_state)
            .ok_or_else(|| Error::Internal(format!("Invalid actual state: {}", row.actual_state)))?;

        let responded_to_agent_at = row
            .responded_to_agent_at
            .as_deref()
            .map(|v| parse_ts(v, "responded_to_agent_at"))
            .transpose()?;

        Ok(Workspace {
            id: row.id,
            cluster_agent_id: row.cluster_agent_id,
            user_id: row.user_id,
            project_id: row.project_id,
            project_ref: row.project_ref,
            devfile_path: row.devfile_path,
            name: row.name,
            namespace: row.namespace,
            desired_state,
            actual_state,
            desired_state_updated_at: parse_ts(
                &row.desired_state_updated_at,
                "desired_state_updated_at",
            )?,
            responded_to_agent_at,
            deployment_resource_version: row.deployment_resource_version,
            devfile: row.devfile,
            processed_devfile: row.processed_devfile,
            url: row.url,
            max_hours_before_termination: row.max_hours_before_termination,
            created_at: parse_ts(&row.created_at, "created_at")?,
            updated_at: parse_ts(&row.updated_at, "updated_at")?,
        })
    }
}

/// Database row for workspace variable
#[derive(Debug, FromRow)]
struct VariableRow {
    key: String,
    variable_type: String,
    value: String,
    user_provided: bool,
}

impl TryFrom<VariableRow> for WorkspaceVariable {
    type Error = Error;

    fn try_from(row: VariableRow) -> Result<Self> {
        let variable_type = VariableType::from_str(&row.variable_type).ok_or_else(|| {
            Error::Internal(format!("Invalid variable type: {}", row.variable_type))
        })?;
        Ok(WorkspaceVariable {
            key: row.key,
            variable_type,
            value: row.value,
            user_provided: row.user_provided,
        })
    }
}

fn into_workspaces(rows: Vec<WorkspaceRow>) -> Result<Vec<Workspace>> {
    rows.into_iter().map(|r| r.try_into()).collect()
}

/// Workspace repository for database operations
pub struct WorkspaceRepository {
    pool: SqlitePool,
}

impl WorkspaceRepository {
    /// Create a new repository with the given pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Start a transaction for a reconciliation cycle
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Check that the database answers
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a workspace with its variables, desired Running and actual
    /// CreationRequested
    pub async fn create(&self, new: NewWorkspace, now: DateTime<Utc>) -> Result<Workspace> {
        let mut tx = self.pool.begin().await?;
        let now = ts(now);

        let id = sqlx::query(
            r#"
            INSERT INTO workspaces (
                cluster_agent_id, user_id, project_id, project_ref, devfile_path, name, namespace,
                desired_state, actual_state, desired_state_updated_at, devfile, processed_devfile,
                url, max_hours_before_termination, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.cluster_agent_id)
        .bind(new.user_id)
        .bind(&new.project_id)
        .bind(&new.project_ref)
        .bind(&new.devfile_path)
        .bind(&new.name)
        .bind(&new.namespace)
        .bind(DesiredState::Running.as_str())
        .bind(ActualState::CreationRequested.as_str())
        .bind(&now)
        .bind(&new.devfile)
        .bind(&new.processed_devfile)
        .bind(&new.url)
        .bind(new.max_hours_before_termination)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for variable in &new.variables {
            sqlx::query(
                r#"
                INSERT INTO workspace_variables (workspace_id, key, variable_type, value, user_provided, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(&variable.key)
            .bind(variable.variable_type.as_str())
            .bind(&variable.value)
            .bind(variable.user_provided)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get(id).await
    }

    /// Get a workspace by ID
    pub async fn get(&self, id: i64) -> Result<Workspace> {
        let row: WorkspaceRow = sqlx::query_as(&format!(
            "SELECT {} FROM workspaces WHERE id = ?",
            WORKSPACE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))?;

        row.try_into()
    }

    /// List workspaces, newest first
    pub async fn list(&self, filter: &WorkspaceFilter) -> Result<Vec<Workspace>> {
        let rows: Vec<WorkspaceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM workspaces
            WHERE (? IS NULL OR cluster_agent_id = ?)
              AND (? IS NULL OR user_id = ?)
            ORDER BY id DESC
            "#,
            WORKSPACE_COLUMNS
        ))
        .bind(filter.agent_id)
        .bind(filter.agent_id)
        .bind(filter.user_id)
        .bind(filter.user_id)
        .fetch_all(&self.pool)
        .await?;

        into_workspaces(rows)
    }

    /// Variables of a workspace in insertion order
    pub async fn variables(&self, workspace_id: i64) -> Result<Vec<WorkspaceVariable>> {
        let mut conn = self.pool.acquire().await?;
        Self::variables_in(&mut conn, workspace_id).await
    }

    pub async fn variables_in(
        conn: &mut SqliteConnection,
        workspace_id: i64,
    ) -> Result<Vec<WorkspaceVariable>> {
        let rows: Vec<VariableRow> = sqlx::query_as(
            r#"
            SELECT key, variable_type, value, user_provided
            FROM workspace_variables
            WHERE workspace_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(workspace_id)
        .fetch_all(conn)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Count workspaces that are not terminated, for quota checks
    pub async fn count_active(&self, agent_id: i64, user_id: Option<i64>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM workspaces
            WHERE cluster_agent_id = ?
              AND (? IS NULL OR user_id = ?)
              AND desired_state != 'Terminated'
              AND actual_state != 'Terminated'
            "#,
        )
        .bind(agent_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Set the desired state; returns the updated workspace
    pub async fn update_desired_state(
        &self,
        id: i64,
        state: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<Workspace> {
        {
            let mut conn = self.pool.acquire().await?;
            Self::update_desired_state_in(&mut conn, id, state, now).await?;
        }
        self.get(id).await
    }

    pub async fn update_desired_state_in(
        conn: &mut SqliteConnection,
        id: i64,
        state: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = ts(now);
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET desired_state = ?, desired_state_updated_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::WorkspaceNotFound(id.to_string()));
        }

        Ok(())
    }

    /// Mark every live workspace of an agent as needing a fresh config
    pub async fn touch_desired_state_for_agent(
        conn: &mut SqliteConnection,
        agent_id: i64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let now = ts(now);
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET desired_state_updated_at = ?, updated_at = ?
            WHERE cluster_agent_id = ? AND actual_state != 'Terminated'
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(agent_id)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Find an agent's workspace by name
    pub async fn find_by_name_in(
        conn: &mut SqliteConnection,
        agent_id: i64,
        name: &str,
    ) -> Result<Option<Workspace>> {
        let row: Option<WorkspaceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM workspaces WHERE cluster_agent_id = ? AND name = ?",
            WORKSPACE_COLUMNS
        ))
        .bind(agent_id)
        .bind(name)
        .fetch_optional(conn)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// All workspaces of an agent that are not terminated
    pub async fn list_active_for_agent_in(
        conn: &mut SqliteConnection,
        agent_id: i64,
    ) -> Result<Vec<Workspace>> {
        let rows: Vec<WorkspaceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM workspaces
            WHERE cluster_agent_id = ? AND actual_state != 'Terminated'
            ORDER BY id ASC
            "#,
            WORKSPACE_COLUMNS
        ))
        .bind(agent_id)
        .fetch_all(conn)
        .await?;

        into_workspaces(rows)
    }

    /// Workspaces whose desired state changed since the agent last heard
    /// about them, or that were never sent at all. A change stamped at the
    /// same instant as the last response counts as undelivered.
    pub async fn list_desired_state_updated_in(
        conn: &mut SqliteConnection,
        agent_id: i64,
    ) -> Result<Vec<Workspace>> {
        let rows: Vec<WorkspaceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM workspaces
            WHERE cluster_agent_id = ?
              AND (responded_to_agent_at IS NULL OR desired_state_updated_at >= responded_to_agent_at)
            ORDER BY id ASC
            "#,
            WORKSPACE_COLUMNS
        ))
        .bind(agent_id)
        .fetch_all(conn)
        .await?;

        into_workspaces(rows)
    }

    /// Record what the agent reported
    pub async fn update_actual_state_in(
        conn: &mut SqliteConnection,
        id: i64,
        state: ActualState,
        deployment_resource_version: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET actual_state = ?, deployment_resource_version = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(deployment_resource_version)
        .bind(ts(now))
        .bind(id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::WorkspaceNotFound(id.to_string()));
        }

        Ok(())
    }

    /// Advance `responded_to_agent_at` for the workspaces of a response
    pub async fn mark_responded_in(
        conn: &mut SqliteConnection,
        ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = ts(now);
        for id in ids {
            sqlx::query("UPDATE workspaces SET responded_to_agent_at = ? WHERE id = ?")
                .bind(&now)
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infra::agent_repository::AgentRepository;
    use crate::infra::sqlite::create_test_pool;
    use chrono::{Duration, SubsecRound};

    pub(crate) fn new_workspace(agent_id: i64, user_id: i64, name: &str) -> NewWorkspace {
        NewWorkspace {
            cluster_agent_id: agent_id,
            user_id,
            project_id: "group/project".to_string(),
            project_ref: "main".to_string(),
            devfile_path: ".devfile.yaml".to_string(),
            name: name.to_string(),
            namespace: format!("ns-{}", name),
            devfile: "schemaVersion: 2.2.0".to_string(),
            processed_devfile: "schemaVersion: 2.2.0".to_string(),
            url: format!("https://60001-{}.workspaces.localdev.me", name),
            max_hours_before_termination: 120,
            variables: vec![
                WorkspaceVariable::environment("GL_WORKSPACE_NAME", name),
                WorkspaceVariable::file("gl_token", "secret"),
            ],
        }
    }

    async fn setup() -> (WorkspaceRepository, i64) {
        let pool = create_test_pool().await;
        let agents = AgentRepository::new(pool.clone());
        let agent = agents
            .create("agent-a", "hash-a", Utc::now())
            .await
            .expect("Failed to create agent");
        (WorkspaceRepository::new(pool), agent.id)
    }

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    #[tokio::test]
    async fn test_create_and_get_workspace() {
        let (repo, agent_id) = setup().await;
        let created_at = now();

        let workspace = repo
            .create(new_workspace(agent_id, 7, "ws-one"), created_at)
            .await
            .expect("Failed to create workspace");
        assert_eq!(workspace.desired_state, DesiredState::Running);
        assert_eq!(workspace.actual_state, ActualState::CreationRequested);
        assert_eq!(workspace.desired_state_updated_at, created_at);
        assert!(workspace.responded_to_agent_at.is_none());

        let variables = repo.variables(workspace.id).await.expect("Failed to list variables");
        assert_eq!(variables.len(), 2);
        assert_eq!(variables[0].key, "GL_WORKSPACE_NAME");
        assert_eq!(variables[1].variable_type, VariableType::File);
    }

    #[tokio::test]
    async fn test_get_missing_workspace() {
        let (repo, _) = setup().await;
        let result = repo.get(42).await;
        assert!(matches!(result, Err(Error::WorkspaceNotFound(_))));
    }

    #[tokio::test]
    async fn test_desired_state_updated_selection() {
        let (repo, agent_id) = setup().await;
        let t0 = now();
        let ws = repo
            .create(new_workspace(agent_id, 1, "ws-sel"), t0)
            .await
            .expect("Failed to create workspace");

        let mut tx = repo.begin().await.expect("Failed to begin");
        let due = WorkspaceRepository::list_desired_state_updated_in(&mut tx, agent_id)
            .await
            .expect("Failed to select");
        assert_eq!(due.len(), 1);

        WorkspaceRepository::mark_responded_in(&mut tx, &[ws.id], t0 + Duration::seconds(1))
            .await
            .expect("Failed to mark");
        let due = WorkspaceRepository::list_desired_state_updated_in(&mut tx, agent_id)
            .await
            .expect("Failed to select");
        assert!(due.is_empty());

        WorkspaceRepository::update_desired_state_in(
            &mut tx,
            ws.id,
            DesiredState::Stopped,
            t0 + Duration::seconds(2),
        )
        .await
        .expect("Failed to update desired state");
        let due = WorkspaceRepository::list_desired_state_updated_in(&mut tx, agent_id)
            .await
            .expect("Failed to select");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].desired_state, DesiredState::Stopped);
        tx.commit().await.expect("Failed to commit");
    }

    #[tokio::test]
    async fn test_change_at_response_instant_is_selected() {
        let (repo, agent_id) = setup().await;
        let t0 = now();
        let ws = repo
            .create(new_workspace(agent_id, 1, "ws-tie"), t0)
            .await
            .expect("Failed to create workspace");

        let t1 = t0 + Duration::seconds(1);
        let mut tx = repo.begin().await.expect("Failed to begin");
        WorkspaceRepository::mark_responded_in(&mut tx, &[ws.id], t1)
            .await
            .expect("Failed to mark");
        WorkspaceRepository::update_desired_state_in(&mut tx, ws.id, DesiredState::Stopped, t1)
            .await
            .expect("Failed to update desired state");

        let due = WorkspaceRepository::list_desired_state_updated_in(&mut tx, agent_id)
            .await
            .expect("Failed to select");
        assert_eq!(due.len(), 1);
        tx.commit().await.expect("Failed to commit");
    }

    #[tokio::test]
    async fn test_active_listing_skips_terminated() {
        let (repo, agent_id) = setup().await;
        let a = repo
            .create(new_workspace(agent_id, 1, "ws-a"), now())
            .await
            .expect("Failed to create workspace");
        repo.create(new_workspace(agent_id, 1, "ws-b"), now())
            .await
            .expect("Failed to create workspace");

        let mut tx = repo.begin().await.expect("Failed to begin");
        WorkspaceRepository::update_actual_state_in(&mut tx, a.id, ActualState::Terminated, None, now())
            .await
            .expect("Failed to update actual state");
        let active = WorkspaceRepository::list_active_for_agent_in(&mut tx, agent_id)
            .await
            .expect("Failed to list");
        tx.commit().await.expect("Failed to commit");

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "ws-b");
        assert_eq!(repo.count_active(agent_id, None).await.unwrap(), 1);
        assert_eq!(repo.count_active(agent_id, Some(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (repo, agent_id) = setup().await;
        repo.create(new_workspace(agent_id, 1, "ws-u1"), now()).await.unwrap();
        repo.create(new_workspace(agent_id, 2, "ws-u2"), now()).await.unwrap();

        let all = repo.list(&WorkspaceFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let user_two = repo
            .list(&WorkspaceFilter {
                agent_id: Some(agent_id),
                user_id: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(user_two.len(), 1);
        assert_eq!(user_two[0].name, "ws-u2");
    }
}
