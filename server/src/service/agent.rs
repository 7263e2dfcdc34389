//! Agent service: registration, token authentication and the workspaces
//! config reported by each agent

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::agent::{
    ClusterAgent, EgressRule, RemoteDevelopmentConfig, WorkspacesAgentConfig, UNLIMITED_QUOTA,
};
use crate::error::{Error, Result};
use crate::infra::agent_repository::AgentRepository;
use crate::infra::clock::Clock;
use crate::infra::workspace_repository::WorkspaceRepository;

const TOKEN_PREFIX: &str = "glagent-";

/// A freshly registered agent with its plaintext token, shown only once
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredAgent {
    #[serde(flatten)]
    pub agent: ClusterAgent,
    pub token: String,
}

/// Agent service
pub struct AgentService {
    repository: Arc<AgentRepository>,
    clock: Arc<dyn Clock>,
}

impl AgentService {
    /// Create a new agent service
    pub fn new(repository: Arc<AgentRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    /// Register an agent and issue its token
    pub async fn register(&self, name: &str) -> Result<RegisteredAgent> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidParameter("agent name is required".to_string()));
        }

        let token = format!("{}{}", TOKEN_PREFIX, Uuid::new_v4().simple());
        let agent = self
            .repository
            .create(name, &hash_token(&token), self.clock.now())
            .await?;

        info!(agent_id = agent.id, name = %agent.name, "Agent registered");
        Ok(RegisteredAgent { agent, token })
    }

    /// Resolve the agent a bearer token belongs to
    pub async fn authenticate(&self, token: &str) -> Result<ClusterAgent> {
        self.repository
            .find_by_token_hash(&hash_token(token))
            .await?
            .ok_or_else(|| Error::Unauthorized("invalid agent token".to_string()))
    }

    /// Store the workspaces config an agent reported.
    ///
    /// Changing the DNS zone changes every rendered config of the agent, so
    /// all its live workspaces are marked for redelivery.
    pub async fn configure(
        &self,
        agent: &ClusterAgent,
        reported: RemoteDevelopmentConfig,
    ) -> Result<WorkspacesAgentConfig> {
        validate(&reported)?;
        let now = self.clock.now();

        let mut tx = self.repository.begin().await?;
        let existing = AgentRepository::find_config_in(&mut tx, agent.id).await?;

        let config = WorkspacesAgentConfig {
            cluster_agent_id: agent.id,
            enabled: reported.enabled,
            dns_zone: reported.dns_zone,
            network_policy_enabled: reported.network_policy.enabled,
            network_policy_egress: reported.network_policy.egress,
            workspaces_quota: reported.workspaces_quota,
            workspaces_per_user_quota: reported.workspaces_per_user_quota,
            max_active_hours_before_stop: reported.max_active_hours_before_stop,
            max_stopped_hours_before_termination: reported.max_stopped_hours_before_termination,
            gitlab_workspaces_proxy_namespace: reported.gitlab_workspaces_proxy.namespace,
            image_pull_secrets: reported.image_pull_secrets,
            default_resources_per_workspace_container: reported
                .default_resources_per_workspace_container,
            max_resources_per_workspace: reported.max_resources_per_workspace,
            labels: reported.labels,
            annotations: reported.annotations,
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
        };
        AgentRepository::upsert_config_in(&mut tx, &config).await?;

        if let Some(existing) = &existing {
            if existing.dns_zone != config.dns_zone {
                let touched =
                    WorkspaceRepository::touch_desired_state_for_agent(&mut tx, agent.id, now)
                        .await?;
                info!(
                    agent_id = agent.id,
                    from = %existing.dns_zone,
                    to = %config.dns_zone,
                    workspaces = touched,
                    "DNS zone changed, workspaces marked for new config"
                );
            }
        }

        tx.commit().await?;

        if !config.enabled {
            warn!(agent_id = agent.id, "Workspaces are disabled for agent");
        }
        info!(agent_id = agent.id, "Agent configuration updated");
        Ok(config)
    }
}

/// Hex sha256 of an agent token; only the hash is stored
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn validate(config: &RemoteDevelopmentConfig) -> Result<()> {
    let invalid = |msg: String| Err(Error::InvalidAgentConfig(msg));

    if !is_valid_dns_zone(&config.dns_zone) {
        return invalid(format!("invalid dns_zone '{}'", config.dns_zone));
    }

    for (field, value) in [
        ("workspaces_quota", config.workspaces_quota),
        ("workspaces_per_user_quota", config.workspaces_per_user_quota),
    ] {
        if value < UNLIMITED_QUOTA {
            return invalid(format!("{} must be {} or greater", field, UNLIMITED_QUOTA));
        }
    }

    for (field, value) in [
        ("max_active_hours_before_stop", config.max_active_hours_before_stop),
        (
            "max_stopped_hours_before_termination",
            config.max_stopped_hours_before_termination,
        ),
    ] {
        if value <= 0 {
            return invalid(format!("{} must be positive", field));
        }
        if Duration::try_hours(value).is_none() {
            return invalid(format!("{} is out of range", field));
        }
    }

    for rule in &config.network_policy.egress {
        validate_egress_rule(rule)?;
    }

    if config.gitlab_workspaces_proxy.namespace.trim().is_empty() {
        return invalid("gitlab_workspaces_proxy.namespace must not be empty".to_string());
    }

    Ok(())
}

fn validate_egress_rule(rule: &EgressRule) -> Result<()> {
    for cidr in std::iter::once(&rule.allow).chain(rule.except.iter()) {
        if !is_valid_cidr(cidr) {
            return Err(Error::InvalidAgentConfig(format!(
                "invalid egress CIDR '{}'",
                cidr
            )));
        }
    }
    Ok(())
}

fn is_valid_dns_zone(zone: &str) -> bool {
    !zone.is_empty()
        && zone.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    addr.parse::<Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::domain::agent::AgentConfigurationRequest;
    use crate::infra::clock::ManualClock;
    use crate::infra::sqlite::create_test_pool;
    use crate::infra::workspace_repository::tests::new_workspace;

    async fn setup() -> (AgentService, Arc<WorkspaceRepository>, Arc<ManualClock>) {
        let pool = create_test_pool().await;
        let clock = Arc::new(ManualClock::new());
        let service = AgentService::new(Arc::new(AgentRepository::new(pool.clone())), clock.clone());
        (service, Arc::new(WorkspaceRepository::new(pool)), clock)
    }

    fn reported(json: &str) -> RemoteDevelopmentConfig {
        serde_json::from_str::<AgentConfigurationRequest>(json)
            .expect("Failed to parse config")
            .remote_development
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let (service, _, _) = setup().await;
        let registered = service.register("agent-a").await.unwrap();
        assert!(registered.token.starts_with(TOKEN_PREFIX));

        let agent = service.authenticate(&registered.token).await.unwrap();
        assert_eq!(agent.id, registered.agent.id);

        let result = service.authenticate("glagent-wrong").await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));

        assert!(matches!(
            service.register("  ").await,
            Err(Error::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_configure_is_idempotent() {
        let (service, _, clock) = setup().await;
        let agent = service.register("agent-a").await.unwrap().agent;
        let body = r#"{"remote_development": {"enabled": true, "dns_zone": "workspaces.example.dev"}}"#;

        let first = service.configure(&agent, reported(body)).await.unwrap();
        clock.advance(Duration::minutes(1));
        let second = service.configure(&agent, reported(body)).await.unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.workspaces_quota, UNLIMITED_QUOTA);
        assert!(second.network_policy_enabled);
    }

    #[tokio::test]
    async fn test_dns_zone_change_marks_workspaces() {
        let (service, workspaces, clock) = setup().await;
        let agent = service.register("agent-a").await.unwrap().agent;
        service
            .configure(
                &agent,
                reported(r#"{"remote_development": {"enabled": true, "dns_zone": "a.example.dev"}}"#),
            )
            .await
            .unwrap();
        let ws = workspaces
            .create(new_workspace(agent.id, 1, "ws-zone"), clock.now())
            .await
            .unwrap();

        clock.advance(Duration::minutes(1));
        service
            .configure(
                &agent,
                reported(r#"{"remote_development": {"enabled": true, "dns_zone": "b.example.dev"}}"#),
            )
            .await
            .unwrap();

        let updated = workspaces.get(ws.id).await.unwrap();
        assert_eq!(updated.desired_state_updated_at, clock.now());
        assert_eq!(updated.desired_state, ws.desired_state);
    }

    #[tokio::test]
    async fn test_configure_rejects_invalid_values() {
        let (service, _, _) = setup().await;
        let agent = service.register("agent-a").await.unwrap().agent;

        for body in [
            r#"{"remote_development": {"dns_zone": ""}}"#,
            r#"{"remote_development": {"dns_zone": "Bad_Zone"}}"#,
            r#"{"remote_development": {"dns_zone": "ok.dev", "workspaces_quota": -2}}"#,
            r#"{"remote_development": {"dns_zone": "ok.dev", "max_active_hours_before_stop": 0}}"#,
            r#"{"remote_development": {"dns_zone": "ok.dev", "max_active_hours_before_stop": 9000000000000000}}"#,
            r#"{"remote_development": {"dns_zone": "ok.dev", "max_stopped_hours_before_termination": 9223372036854775807}}"#,
            r#"{"remote_development": {"dns_zone": "ok.dev", "network_policy": {"egress": [{"allow": "10.0.0.0/33"}]}}}"#,
        ] {
            let result = service.configure(&agent, reported(body)).await;
            assert!(
                matches!(result, Err(Error::InvalidAgentConfig(_))),
                "expected rejection for {}",
                body
            );
        }
    }

    #[test]
    fn test_cidr_validation() {
        assert!(is_valid_cidr("0.0.0.0/0"));
        assert!(is_valid_cidr("192.168.0.0/16"));
        assert!(!is_valid_cidr("192.168.0.0"));
        assert!(!is_valid_cidr("300.0.0.0/8"));
        assert!(!is_valid_cidr("10.0.0.0/x"));
    }

    #[test]
    fn test_token_hash_is_hex_sha256() {
        let hash = hash_token("glagent-abc");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_token("glagent-abc"));
    }
}
