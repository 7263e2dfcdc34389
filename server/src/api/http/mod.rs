//! HTTP API handlers

mod agent;
mod health;
mod workspace;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Prefix of the endpoints polled by cluster agents
pub const AGENT_API_PREFIX: &str = "/api/v4/internal/kubernetes/modules/remote_development";

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Agent registration
        .route("/agents", post(agent::register_agent))
        // Workspace routes
        .route("/workspaces", post(workspace::create_workspace))
        .route("/workspaces", get(workspace::list_workspaces))
        .route(
            "/workspaces/{id}",
            get(workspace::get_workspace).patch(workspace::update_workspace),
        );

    let agent_routes = Router::new()
        .route("/reconcile", post(agent::reconcile))
        .route("/agent_configuration", post(agent::agent_configuration));

    Router::new()
        .nest("/api/v1", api_routes)
        .nest(AGENT_API_PREFIX, agent_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
    };
    use chrono::Duration;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::domain::devfile::tests::EXAMPLE_DEVFILE;
    use crate::infra::agent_repository::AgentRepository;
    use crate::infra::clock::ManualClock;
    use crate::infra::devfile_source::MockDevfileSource;
    use crate::infra::sqlite::create_test_pool;
    use crate::infra::workspace_repository::WorkspaceRepository;
    use crate::service::agent::AgentService;
    use crate::service::reconcile::ReconcileService;
    use crate::service::workspace::WorkspaceService;
    use crate::Config;

    struct TestApp {
        router: Router,
        clock: Arc<ManualClock>,
    }

    impl TestApp {
        async fn new() -> Self {
            let pool = create_test_pool().await;
            let config = Arc::new(Config::default());
            let clock = Arc::new(ManualClock::new());
            let workspaces = Arc::new(WorkspaceRepository::new(pool.clone()));
            let agents = Arc::new(AgentRepository::new(pool));

            let mut source = MockDevfileSource::new();
            source
                .expect_fetch()
                .returning(|_, _, _| Ok(EXAMPLE_DEVFILE.to_string()));

            let state = AppState {
                workspace_service: Arc::new(WorkspaceService::new(
                    workspaces.clone(),
                    agents.clone(),
                    Arc::new(source),
                    config.clone(),
                    clock.clone(),
                )),
                agent_service: Arc::new(AgentService::new(agents, clock.clone())),
                reconcile_service: Arc::new(ReconcileService::new(
                    workspaces,
                    config,
                    clock.clone(),
                )),
            };

            Self {
                router: create_router(state),
                clock,
            }
        }

        async fn send(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            self.clock.advance(Duration::seconds(1));

            let mut builder = Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);

            let response = self
                .router
                .clone()
                .oneshot(builder.body(body).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }

        async fn register_agent(&self) -> (i64, String) {
            let (status, body) = self
                .send(Method::POST, "/api/v1/agents", None, Some(json!({"name": "agent-a"})))
                .await;
            assert_eq!(status, StatusCode::CREATED);
            let token = body["token"].as_str().unwrap().to_string();

            let (status, _) = self
                .send(
                    Method::POST,
                    &format!("{}/agent_configuration", AGENT_API_PREFIX),
                    Some(&token),
                    Some(json!({"remote_development": {
                        "enabled": true,
                        "dns_zone": "workspaces.localdev.me"
                    }})),
                )
                .await;
            assert_eq!(status, StatusCode::NO_CONTENT);

            (body["id"].as_i64().unwrap(), token)
        }

        async fn reconcile(&self, token: &str, infos: Value) -> Vec<Value> {
            let (status, body) = self
                .send(
                    Method::POST,
                    &format!("{}/reconcile", AGENT_API_PREFIX),
                    Some(token),
                    Some(json!({"update_type": "partial", "workspace_agent_infos": infos})),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(body["settings"]["partial_reconciliation_interval_seconds"], 10);
            body["workspace_rails_infos"].as_array().unwrap().clone()
        }
    }

    fn agent_info(name: &str, namespace: &str, state: &str, version: &str) -> Value {
        json!([{
            "name": name,
            "namespace": namespace,
            "actual_state": state,
            "deployment_resource_version": version
        }])
    }

    #[tokio::test]
    async fn test_health() {
        let app = TestApp::new().await;
        let (status, body) = app.send(Method::GET, "/api/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_agent_endpoints_require_token() {
        let app = TestApp::new().await;
        let uri = format!("{}/reconcile", AGENT_API_PREFIX);
        let body = json!({"update_type": "partial"});

        let (status, _) = app.send(Method::POST, &uri, None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, error) = app
            .send(Method::POST, &uri, Some("glagent-unknown"), Some(body))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error["code"], 5006);
    }

    #[tokio::test]
    async fn test_workspace_lifecycle_over_reconciliation() {
        let app = TestApp::new().await;
        let (agent_id, token) = app.register_agent().await;

        let (status, ws) = app
            .send(
                Method::POST,
                "/api/v1/workspaces",
                None,
                Some(json!({
                    "cluster_agent_id": agent_id,
                    "user_id": 1,
                    "project_id": "group/project"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = ws["id"].as_i64().unwrap();
        let name = ws["name"].as_str().unwrap().to_string();
        let namespace = ws["namespace"].as_str().unwrap().to_string();

        // first poll delivers the full config
        let infos = app.reconcile(&token, json!([])).await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0]["name"], name.as_str());
        assert_eq!(infos[0]["desired_state"], "Running");
        assert_eq!(infos[0]["actual_state"], "CreationRequested");
        assert!(infos[0]["config_to_apply"]
            .as_str()
            .is_some_and(|c| c.contains("kind: Deployment")));

        // agent reports Running
        let infos = app
            .reconcile(&token, agent_info(&name, &namespace, "Running", "1"))
            .await;
        assert_eq!(infos[0]["actual_state"], "Running");
        assert!(infos[0]["config_to_apply"].is_null());

        // user stops the workspace
        let (status, updated) = app
            .send(
                Method::PATCH,
                &format!("/api/v1/workspaces/{}", id),
                None,
                Some(json!({"desired_state": "Stopped"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["desired_state"], "Stopped");

        let infos = app
            .reconcile(&token, agent_info(&name, &namespace, "Running", "1"))
            .await;
        assert_eq!(infos[0]["desired_state"], "Stopped");
        assert_eq!(infos[0]["actual_state"], "Running");
        assert!(infos[0]["config_to_apply"]
            .as_str()
            .is_some_and(|c| c.contains("replicas: 0")));

        let infos = app
            .reconcile(&token, agent_info(&name, &namespace, "Stopping", "2"))
            .await;
        assert_eq!(infos[0]["actual_state"], "Stopping");
        assert!(infos[0]["config_to_apply"].is_null());

        let infos = app
            .reconcile(&token, agent_info(&name, &namespace, "Stopped", "3"))
            .await;
        assert_eq!(infos[0]["actual_state"], "Stopped");
        assert!(infos[0]["config_to_apply"].is_null());

        let infos = app.reconcile(&token, json!([])).await;
        assert!(infos.is_empty());

        let (status, ws) = app
            .send(Method::GET, &format!("/api/v1/workspaces/{}", id), None, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ws["actual_state"], "Stopped");
        assert_eq!(ws["deployment_resource_version"], "3");
    }

    #[tokio::test]
    async fn test_control_api_errors() {
        let app = TestApp::new().await;
        let (agent_id, _) = app.register_agent().await;

        let (status, body) = app.send(Method::GET, "/api/v1/workspaces/42", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 2001);

        let (status, ws) = app
            .send(
                Method::POST,
                "/api/v1/workspaces",
                None,
                Some(json!({"cluster_agent_id": agent_id, "user_id": 2, "project_id": "group/project"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let uri = format!("/api/v1/workspaces/{}", ws["id"]);

        let (status, _) = app
            .send(Method::PATCH, &uri, None, Some(json!({"desired_state": "Terminated"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = app
            .send(Method::PATCH, &uri, None, Some(json!({"desired_state": "Running"})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], 2002);

        let (status, body) = app
            .send(
                Method::GET,
                &format!("/api/v1/workspaces?agent_id={}&user_id=2", agent_id),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);

        let (status, _) = app
            .send(Method::POST, "/api/v1/agents", None, Some(json!({"name": "agent-a"})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
