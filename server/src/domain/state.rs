//! Workspace state machine
//!
//! Desired state is written by users, actual state by the agent. This module
//! holds the transition table for actual states, the rule that decides
//! whether a reconciliation response must carry a config, and the calculator
//! that classifies a reported Kubernetes deployment.

use serde_json::Value;

use super::reconcile::{TerminationProgress, UpdateType, WorkspaceAgentInfo};
use super::workspace::{ActualState, DesiredState, Workspace};

impl ActualState {
    /// Legal transitions for agent-reported states
    pub fn can_transition_to(self, next: ActualState) -> bool {
        use ActualState::*;

        // Same-state reports only refresh the resource version
        if self == next {
            return true;
        }

        match self {
            CreationRequested => matches!(
                next,
                Starting | Running | Failed | Error | Terminating | Terminated | Unknown
            ),
            Starting => matches!(
                next,
                Running | Stopping | Stopped | Failed | Error | Terminating | Terminated | Unknown
            ),
            Running => matches!(
                next,
                Stopping | Stopped | Failed | Error | Terminating | Terminated | Unknown
            ),
            Stopping => matches!(
                next,
                Stopped | Starting | Failed | Error | Terminating | Terminated | Unknown
            ),
            Stopped => matches!(
                next,
                Starting | Running | Failed | Error | Terminating | Terminated | Unknown
            ),
            Terminating => matches!(next, Terminated | Unknown | Error),
            Failed | Error | Unknown => next != CreationRequested,
            Terminated => false,
        }
    }
}

impl DesiredState {
    /// Terminated is one-way; everything else may be set freely
    pub fn can_change_to(self, next: DesiredState) -> bool {
        self != DesiredState::Terminated || next == DesiredState::Terminated
    }
}

/// Outcome of applying an agent report to the stored actual state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActualStateUpdate {
    /// The report follows the transition table
    Accepted(ActualState),
    /// The report skips or reverses a step; recorded anyway
    OutOfOrder(ActualState),
    /// The workspace is already terminated; the report is dropped
    Absorbed,
}

/// Decide what to record when the agent reports `reported` for a workspace
/// currently in `current`. Reports are best effort: anything but leaving
/// `Terminated` is recorded.
pub fn apply_reported_state(current: ActualState, reported: ActualState) -> ActualStateUpdate {
    if current == ActualState::Terminated {
        return if reported == ActualState::Terminated {
            ActualStateUpdate::Accepted(reported)
        } else {
            ActualStateUpdate::Absorbed
        };
    }

    if current.can_transition_to(reported) {
        ActualStateUpdate::Accepted(reported)
    } else {
        ActualStateUpdate::OutOfOrder(reported)
    }
}

/// Whether the response for `workspace` must include a config to apply.
///
/// Evaluated on the state as it stands before `responded_to_agent_at` is
/// advanced for the current response.
/// A desired state change stamped at the same instant as the last response
/// is treated as undelivered, so it may be sent twice but is never lost.
pub fn requires_config_apply(update_type: UpdateType, workspace: &Workspace) -> bool {
    if workspace.is_terminated() {
        return false;
    }

    if update_type == UpdateType::Full {
        return true;
    }

    let never_seen_by_agent = workspace.deployment_resource_version.is_none()
        && workspace.actual_state == ActualState::CreationRequested;

    match workspace.responded_to_agent_at {
        None => true,
        Some(_) if never_seen_by_agent => true,
        Some(responded_at) => workspace.desired_state_updated_at >= responded_at,
    }
}

/// Derive the actual state from what the agent reported.
///
/// Precedence: error details, termination progress, explicit state,
/// absent resources, then the deployment object. `None` means the report
/// carries nothing that identifies a state.
pub fn calculate_actual_state(
    info: &WorkspaceAgentInfo,
    desired_state: DesiredState,
) -> Option<ActualState> {
    if info.error_details.is_some() {
        return Some(ActualState::Error);
    }

    if let Some(progress) = info.termination_progress {
        return Some(match progress {
            TerminationProgress::Terminating => ActualState::Terminating,
            TerminationProgress::Terminated => ActualState::Terminated,
        });
    }

    if let Some(state) = info.actual_state {
        return Some(state);
    }

    if info.resources_present == Some(false) && desired_state == DesiredState::Terminated {
        return Some(ActualState::Terminated);
    }

    info.latest_k8s_deployment_info
        .as_ref()
        .map(state_from_deployment)
}

const PROGRESSING: &str = "Progressing";
const AVAILABLE: &str = "Available";
const NEW_REPLICA_SET_AVAILABLE: &str = "NewReplicaSetAvailable";
const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

/// Classify a Kubernetes Deployment object
pub fn state_from_deployment(deployment: &Value) -> ActualState {
    let spec_replicas = deployment
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let status = deployment.get("status");
    let status_replicas = status
        .and_then(|s| s.get("replicas"))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let progressing = find_condition(deployment, PROGRESSING);
    let available = find_condition(deployment, AVAILABLE);

    if let Some((status, reason)) = progressing {
        if status == "False" && reason == PROGRESS_DEADLINE_EXCEEDED {
            return ActualState::Failed;
        }
    }

    if spec_replicas == 0 {
        return if status_replicas > 0 {
            ActualState::Stopping
        } else {
            ActualState::Stopped
        };
    }

    let is_available = matches!(available, Some((status, _)) if status == "True");
    match progressing {
        Some((status, reason)) if status == "True" && reason == NEW_REPLICA_SET_AVAILABLE => {
            if is_available {
                ActualState::Running
            } else {
                ActualState::Starting
            }
        }
        Some((status, _)) if status == "True" => ActualState::Starting,
        _ => ActualState::Unknown,
    }
}

fn find_condition<'a>(deployment: &'a Value, kind: &str) -> Option<(&'a str, &'a str)> {
    deployment
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
        .map(|c| {
            (
                c.get("status").and_then(Value::as_str).unwrap_or(""),
                c.get("reason").and_then(Value::as_str).unwrap_or(""),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reconcile::ErrorDetails;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[test]
    fn test_terminated_is_absorbing() {
        use ActualState::*;
        for next in [
            CreationRequested, Starting, Running, Stopping, Stopped, Terminating, Failed, Error,
            Unknown,
        ] {
            assert!(!Terminated.can_transition_to(next));
            assert_eq!(apply_reported_state(Terminated, next), ActualStateUpdate::Absorbed);
        }
        assert_eq!(
            apply_reported_state(Terminated, Terminated),
            ActualStateUpdate::Accepted(Terminated)
        );
    }

    #[test]
    fn test_lifecycle_transitions_accepted() {
        use ActualState::*;
        let path = [CreationRequested, Starting, Running, Stopping, Stopped, Starting, Running, Terminating, Terminated];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_out_of_order_report_is_still_recorded() {
        assert_eq!(
            apply_reported_state(ActualState::Terminating, ActualState::Stopped),
            ActualStateUpdate::OutOfOrder(ActualState::Stopped)
        );
        assert_eq!(
            apply_reported_state(ActualState::CreationRequested, ActualState::Stopping),
            ActualStateUpdate::OutOfOrder(ActualState::Stopping)
        );
    }

    #[test]
    fn test_desired_terminated_is_one_way() {
        assert!(DesiredState::Running.can_change_to(DesiredState::Stopped));
        assert!(DesiredState::Stopped.can_change_to(DesiredState::Terminated));
        assert!(!DesiredState::Terminated.can_change_to(DesiredState::Running));
        assert!(DesiredState::Terminated.can_change_to(DesiredState::Terminated));
    }

    #[test]
    fn test_config_required_on_first_response() {
        let ws = Workspace::fixture(Utc::now());
        assert!(requires_config_apply(UpdateType::Partial, &ws));
    }

    #[test]
    fn test_config_not_required_when_nothing_changed() {
        let now = Utc::now();
        let mut ws = Workspace::fixture(now - Duration::minutes(5));
        ws.responded_to_agent_at = Some(now - Duration::minutes(1));
        ws.actual_state = ActualState::Running;
        ws.deployment_resource_version = Some("7".into());
        assert!(!requires_config_apply(UpdateType::Partial, &ws));
        assert!(requires_config_apply(UpdateType::Full, &ws));
    }

    #[test]
    fn test_config_required_after_desired_change() {
        let now = Utc::now();
        let mut ws = Workspace::fixture(now - Duration::minutes(5));
        ws.responded_to_agent_at = Some(now - Duration::minutes(1));
        ws.actual_state = ActualState::Running;
        ws.deployment_resource_version = Some("7".into());
        ws.desired_state = DesiredState::Stopped;
        ws.desired_state_updated_at = now;
        assert!(requires_config_apply(UpdateType::Partial, &ws));
    }

    #[test]
    fn test_config_required_for_change_at_response_instant() {
        let now = Utc::now();
        let mut ws = Workspace::fixture(now - Duration::minutes(5));
        ws.responded_to_agent_at = Some(now);
        ws.actual_state = ActualState::Running;
        ws.deployment_resource_version = Some("7".into());
        ws.desired_state = DesiredState::Stopped;
        ws.desired_state_updated_at = now;
        assert!(requires_config_apply(UpdateType::Partial, &ws));
    }

    #[test]
    fn test_config_never_sent_for_terminated_workspace() {
        let mut ws = Workspace::fixture(Utc::now());
        ws.actual_state = ActualState::Terminated;
        assert!(!requires_config_apply(UpdateType::Full, &ws));
        assert!(!requires_config_apply(UpdateType::Partial, &ws));
    }

    fn deployment(replicas: i64, status_replicas: i64, conditions: Value) -> Value {
        json!({
            "spec": {"replicas": replicas},
            "status": {"replicas": status_replicas, "conditions": conditions}
        })
    }

    #[test]
    fn test_deployment_classification() {
        let running = deployment(
            1,
            1,
            json!([
                {"type": "Available", "status": "True", "reason": "MinimumReplicasAvailable"},
                {"type": "Progressing", "status": "True", "reason": "NewReplicaSetAvailable"}
            ]),
        );
        assert_eq!(state_from_deployment(&running), ActualState::Running);

        let starting = deployment(
            1,
            1,
            json!([
                {"type": "Available", "status": "False", "reason": "MinimumReplicasUnavailable"},
                {"type": "Progressing", "status": "True", "reason": "ReplicaSetUpdated"}
            ]),
        );
        assert_eq!(state_from_deployment(&starting), ActualState::Starting);

        assert_eq!(
            state_from_deployment(&deployment(0, 1, json!([]))),
            ActualState::Stopping
        );
        assert_eq!(
            state_from_deployment(&deployment(0, 0, json!([]))),
            ActualState::Stopped
        );

        let failed = deployment(
            1,
            1,
            json!([{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}]),
        );
        assert_eq!(state_from_deployment(&failed), ActualState::Failed);

        assert_eq!(
            state_from_deployment(&deployment(1, 0, json!([]))),
            ActualState::Unknown
        );
    }

    #[test]
    fn test_calculation_precedence() {
        let mut info = WorkspaceAgentInfo {
            actual_state: Some(ActualState::Running),
            termination_progress: Some(TerminationProgress::Terminating),
            ..Default::default()
        };
        assert_eq!(
            calculate_actual_state(&info, DesiredState::Terminated),
            Some(ActualState::Terminating)
        );

        info.error_details = Some(ErrorDetails {
            error_type: "applier".into(),
            error_message: None,
        });
        assert_eq!(
            calculate_actual_state(&info, DesiredState::Running),
            Some(ActualState::Error)
        );

        let gone = WorkspaceAgentInfo {
            resources_present: Some(false),
            ..Default::default()
        };
        assert_eq!(
            calculate_actual_state(&gone, DesiredState::Terminated),
            Some(ActualState::Terminated)
        );
        assert_eq!(calculate_actual_state(&gone, DesiredState::Running), None);
    }
}
