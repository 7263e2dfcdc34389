//! Cluster agent and its workspaces configuration

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel quota value meaning "no limit"
pub const UNLIMITED_QUOTA: i64 = -1;

/// A Kubernetes-side agent that polls for reconciliation work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAgent {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A single egress allow rule of the workspace network policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRule {
    pub allow: String,
    #[serde(default)]
    pub except: Vec<String>,
}

/// Reference to a pull secret the workspace pods may use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePullSecret {
    pub name: String,
    pub namespace: String,
}

/// Per-agent workspaces configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspacesAgentConfig {
    pub cluster_agent_id: i64,
    pub enabled: bool,
    pub dns_zone: String,
    pub network_policy_enabled: bool,
    pub network_policy_egress: Vec<EgressRule>,
    pub workspaces_quota: i64,
    pub workspaces_per_user_quota: i64,
    pub max_active_hours_before_stop: i64,
    pub max_stopped_hours_before_termination: i64,
    pub gitlab_workspaces_proxy_namespace: String,
    pub image_pull_secrets: Vec<ImagePullSecret>,
    pub default_resources_per_workspace_container: serde_json::Value,
    pub max_resources_per_workspace: serde_json::Value,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspacesAgentConfig {
    /// Whether `count` existing workspaces leave room for one more
    pub fn allows_another(quota: i64, count: i64) -> bool {
        quota == UNLIMITED_QUOTA || count < quota
    }
}

/// The `remote_development` section of an agent's config file
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDevelopmentConfig {
    #[serde(default)]
    pub enabled: bool,
    pub dns_zone: String,
    #[serde(default)]
    pub network_policy: NetworkPolicyConfig,
    #[serde(default = "default_quota")]
    pub workspaces_quota: i64,
    #[serde(default = "default_quota")]
    pub workspaces_per_user_quota: i64,
    #[serde(default = "default_max_active_hours_before_stop")]
    pub max_active_hours_before_stop: i64,
    #[serde(default = "default_max_stopped_hours_before_termination")]
    pub max_stopped_hours_before_termination: i64,
    #[serde(default)]
    pub gitlab_workspaces_proxy: WorkspacesProxyConfig,
    #[serde(default)]
    pub image_pull_secrets: Vec<ImagePullSecret>,
    #[serde(default = "empty_object")]
    pub default_resources_per_workspace_container: serde_json::Value,
    #[serde(default = "empty_object")]
    pub max_resources_per_workspace: serde_json::Value,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkPolicyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_egress")]
    pub egress: Vec<EgressRule>,
}

impl Default for NetworkPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            egress: default_egress(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspacesProxyConfig {
    #[serde(default = "default_proxy_namespace")]
    pub namespace: String,
}

impl Default for WorkspacesProxyConfig {
    fn default() -> Self {
        Self {
            namespace: default_proxy_namespace(),
        }
    }
}

/// Body of the agent_configuration request
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfigurationRequest {
    pub remote_development: RemoteDevelopmentConfig,
}

fn default_quota() -> i64 {
    UNLIMITED_QUOTA
}

fn default_max_active_hours_before_stop() -> i64 {
    36
}

fn default_max_stopped_hours_before_termination() -> i64 {
    744
}

fn default_true() -> bool {
    true
}

fn default_proxy_namespace() -> String {
    "gitlab-workspaces".to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Public internet is allowed, private ranges are not
pub fn default_egress() -> Vec<EgressRule> {
    vec![EgressRule {
        allow: "0.0.0.0/0".to_string(),
        except: vec![
            "10.0.0.0/8".to_string(),
            "172.16.0.0/12".to_string(),
            "192.168.0.0/16".to_string(),
        ],
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_check() {
        assert!(WorkspacesAgentConfig::allows_another(UNLIMITED_QUOTA, 1000));
        assert!(WorkspacesAgentConfig::allows_another(2, 1));
        assert!(!WorkspacesAgentConfig::allows_another(2, 2));
        assert!(!WorkspacesAgentConfig::allows_another(0, 0));
    }

    #[test]
    fn test_config_file_defaults() {
        let req: AgentConfigurationRequest = serde_json::from_str(
            r#"{"remote_development": {"enabled": true, "dns_zone": "workspaces.example.dev"}}"#,
        )
        .unwrap();
        let cfg = req.remote_development;
        assert!(cfg.network_policy.enabled);
        assert_eq!(cfg.network_policy.egress, default_egress());
        assert_eq!(cfg.workspaces_quota, UNLIMITED_QUOTA);
        assert_eq!(cfg.max_active_hours_before_stop, 36);
        assert_eq!(cfg.gitlab_workspaces_proxy.namespace, "gitlab-workspaces");
    }
}
