//! Reconciliation scheduling and time-based lifecycle policy

use chrono::{DateTime, Duration, Utc};

use super::agent::WorkspacesAgentConfig;
use super::reconcile::ReconcileSettings;
use super::workspace::{DesiredState, Workspace};
use crate::Config;

impl ReconcileSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            partial_reconciliation_interval_seconds: config.partial_reconciliation_interval_seconds,
            full_reconciliation_interval_seconds: config.full_reconciliation_interval_seconds,
        }
    }
}

/// Desired state a workspace should be moved to because time passed without
/// user action, evaluated as of `now`.
///
/// The hard termination cap is checked first, then the per-agent
/// active/stopped thresholds measured from the last desired state change.
/// A threshold too large to be represented as a duration never elapses.
pub fn lifecycle_transition(
    workspace: &Workspace,
    agent_config: &WorkspacesAgentConfig,
    now: DateTime<Utc>,
) -> Option<DesiredState> {
    if workspace.desired_state == DesiredState::Terminated {
        return None;
    }

    if hours_elapsed(
        workspace.created_at,
        now,
        workspace.max_hours_before_termination,
    ) {
        return Some(DesiredState::Terminated);
    }

    let since = workspace.desired_state_updated_at;
    match workspace.desired_state {
        DesiredState::Running
            if hours_elapsed(since, now, agent_config.max_active_hours_before_stop) =>
        {
            Some(DesiredState::Stopped)
        }
        DesiredState::Stopped
            if hours_elapsed(since, now, agent_config.max_stopped_hours_before_termination) =>
        {
            Some(DesiredState::Terminated)
        }
        _ => None,
    }
}

fn hours_elapsed(since: DateTime<Utc>, now: DateTime<Utc>, hours: i64) -> bool {
    Duration::try_hours(hours).is_some_and(|limit| now - since >= limit)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;

    pub(crate) fn agent_config(active_hours: i64, stopped_hours: i64) -> WorkspacesAgentConfig {
        let now = Utc::now();
        WorkspacesAgentConfig {
            cluster_agent_id: 1,
            enabled: true,
            dns_zone: "workspaces.localdev.me".to_string(),
            network_policy_enabled: true,
            network_policy_egress: crate::domain::agent::default_egress(),
            workspaces_quota: -1,
            workspaces_per_user_quota: -1,
            max_active_hours_before_stop: active_hours,
            max_stopped_hours_before_termination: stopped_hours,
            gitlab_workspaces_proxy_namespace: "gitlab-workspaces".to_string(),
            image_pull_secrets: Vec::new(),
            default_resources_per_workspace_container: serde_json::json!({}),
            max_resources_per_workspace: serde_json::json!({}),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_running_workspace_stopped_after_threshold() {
        let now = Utc::now();
        let config = agent_config(36, 744);

        let ws = Workspace::fixture(now - Duration::hours(35));
        assert_eq!(lifecycle_transition(&ws, &config, now), None);

        let ws = Workspace::fixture(now - Duration::hours(36));
        assert_eq!(
            lifecycle_transition(&ws, &config, now),
            Some(DesiredState::Stopped)
        );
    }

    #[test]
    fn test_stopped_workspace_terminated_after_threshold() {
        let now = Utc::now();
        let config = agent_config(36, 48);

        let mut ws = Workspace::fixture(now - Duration::hours(100));
        ws.desired_state = DesiredState::Stopped;
        ws.desired_state_updated_at = now - Duration::hours(47);
        assert_eq!(lifecycle_transition(&ws, &config, now), None);

        ws.desired_state_updated_at = now - Duration::hours(48);
        assert_eq!(
            lifecycle_transition(&ws, &config, now),
            Some(DesiredState::Terminated)
        );
    }

    #[test]
    fn test_termination_cap_wins() {
        let now = Utc::now();
        let config = agent_config(1000, 1000);
        let mut ws = Workspace::fixture(now - Duration::hours(121));
        ws.desired_state_updated_at = now;
        assert_eq!(
            lifecycle_transition(&ws, &config, now),
            Some(DesiredState::Terminated)
        );

        ws.desired_state = DesiredState::Terminated;
        assert_eq!(lifecycle_transition(&ws, &config, now), None);
    }

    #[test]
    fn test_unrepresentable_thresholds_never_elapse() {
        let now = Utc::now();
        let config = agent_config(9_000_000_000_000_000, i64::MAX);

        let mut ws = Workspace::fixture(now - Duration::hours(10_000));
        ws.max_hours_before_termination = i64::MAX;
        assert_eq!(lifecycle_transition(&ws, &config, now), None);

        ws.desired_state = DesiredState::Stopped;
        assert_eq!(lifecycle_transition(&ws, &config, now), None);
    }
}
