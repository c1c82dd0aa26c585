//! Preview controller HTTP routes: REST API and GitHub webhook.

pub mod api;
pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::Router;

use crate::error::PreviewResult;
use crate::services::deployment_service::DeploymentOrchestrator;
use crate::services::environment_service::EnvironmentManager;
use crate::store::Store;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub environments: Arc<EnvironmentManager>,
    pub deployments: Arc<DeploymentOrchestrator>,
    pub store: Arc<dyn Store>,
    pub webhook_secret: String,
}

const REPO: &str = "/projects/{project_id}/clusters/{cluster_id}/gitrepos/{installation_id}/{owner}/{name}";
const CLUSTER: &str = "/projects/{project_id}/clusters/{cluster_id}";

/// Build the controller's router (nested at `/api`).
pub fn preview_router(state: AppState) -> Router {
    Router::new()
        // Webhook
        .route("/github/incoming_webhook/{webhook_uid}", post(webhook_handler))
        // Environments by repository
        .route(
            &format!("{REPO}/environments"),
            post(api::bind_environment).delete(api::unbind_environment),
        )
        .route(&format!("{REPO}/environment"), get(api::get_environment))
        // Deployments by repository (CI callbacks)
        .route(
            &format!("{REPO}/deployments"),
            post(api::create_deployment).get(api::list_repo_deployments),
        )
        .route(
            &format!("{REPO}/deployment"),
            get(api::get_selected_deployment).delete(api::delete_selected_deployment),
        )
        .route(&format!("{REPO}/deployments/update"), put(api::update_selected_deployment))
        .route(&format!("{REPO}/deployments/finalize"), post(api::finalize_selected_deployment))
        .route(&format!("{REPO}/deployments/finalize_errors"), post(api::finalize_selected_errors))
        .route(&format!("{REPO}/deployments/status"), put(api::update_selected_status))
        // Environments by cluster
        .route(&format!("{CLUSTER}/environments"), get(api::list_environments))
        .route(&format!("{CLUSTER}/environments/{{environment_id}}"), get(api::get_environment_by_id))
        .route(
            &format!("{CLUSTER}/repositories/{{owner}}/{{name}}/environment"),
            get(api::get_environment_by_repository),
        )
        .route(&format!("{CLUSTER}/environments/{{environment_id}}/settings"), put(api::update_settings))
        .route(
            &format!("{CLUSTER}/environments/{{environment_id}}/toggle_new_comment"),
            put(api::toggle_new_comment),
        )
        .route(
            &format!("{CLUSTER}/environments/{{environment_id}}/validate_porter_yaml"),
            post(api::validate_porter_yaml),
        )
        .route(
            &format!("{CLUSTER}/environments/{{environment_id}}/deployments"),
            get(api::list_environment_deployments),
        )
        .route(
            &format!("{CLUSTER}/environments/{{environment_id}}/deployments/{{deployment_id}}"),
            get(api::get_environment_deployment),
        )
        // Deployments by cluster
        .route(&format!("{CLUSTER}/deployments"), get(api::list_cluster_deployments))
        .route(
            &format!("{CLUSTER}/namespaces/{{namespace}}/deployment"),
            get(api::get_deployment_by_namespace),
        )
        .route(
            &format!("{CLUSTER}/deployments/{{deployment_id}}"),
            get(api::get_deployment).delete(api::delete_deployment),
        )
        .route(&format!("{CLUSTER}/deployments/{{deployment_id}}/update"), put(api::update_deployment))
        .route(&format!("{CLUSTER}/deployments/{{deployment_id}}/finalize"), put(api::finalize_deployment))
        .route(
            &format!("{CLUSTER}/deployments/{{deployment_id}}/finalize_errors"),
            put(api::finalize_deployment_errors),
        )
        .route(&format!("{CLUSTER}/deployments/{{deployment_id}}/status"), put(api::update_deployment_status))
        .route(&format!("{CLUSTER}/deployments/{{deployment_id}}/reenable"), put(api::reenable_deployment))
        .route(
            &format!("{CLUSTER}/deployments/{{deployment_id}}/trigger_workflow"),
            post(api::trigger_workflow),
        )
        .route(&format!("{CLUSTER}/deployments/{{deployment_id}}/revisions"), get(api::deployment_revisions))
        .route(&format!("{CLUSTER}/deployments/{{deployment_id}}/logs"), get(api::deployment_logs))
        .with_state(state)
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<AppState>,
    Path(webhook_uid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> PreviewResult<StatusCode> {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state, &webhook_uid, &headers, body).await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::error::PR_CLOSED;
    use crate::models::environment::{Environment, EnvironmentMode};
    use crate::services::environment_service::BindSettings;
    use crate::services::github::signature::sign;
    use crate::services::github::PullRequestState;
    use crate::services::testing::{seed_environment, FakeCluster, FakeClusters, FakeScm};
    use crate::store::memory::MemoryStore;

    const SECRET: &str = "hook-secret";
    const REPO_URI: &str = "/projects/1/clusters/1/gitrepos/9/acme/web";

    struct TestApp {
        app: Router,
        store: Arc<MemoryStore>,
        scm: Arc<FakeScm>,
        env: Environment,
    }

    async fn test_app() -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let scm = FakeScm::new();
        let deployments = Arc::new(DeploymentOrchestrator::new(
            store.clone(),
            scm.clone(),
            Arc::new(FakeClusters(FakeCluster::new())),
            3,
        ));
        let environments = Arc::new(EnvironmentManager::new(
            store.clone(),
            scm.clone(),
            deployments.clone(),
            BindSettings {
                server_url: "https://preview.example.com".to_string(),
                webhook_secret: SECRET.to_string(),
                token_signing_key: "signing-key".to_string(),
            },
        ));
        let env = seed_environment(store.as_ref(), EnvironmentMode::Manual).await;

        let app = preview_router(AppState {
            environments,
            deployments,
            store: store.clone(),
            webhook_secret: SECRET.to_string(),
        });
        TestApp { app, store, scm, env }
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn create_pr_7(t: &TestApp) -> Value {
        t.scm.open_pull(7, "feat");
        let (status, body) = send(
            &t.app,
            Method::POST,
            &format!("{REPO_URI}/deployments"),
            Some(json!({
                "namespace": "pr-7",
                "pull_request_id": 7,
                "pr_branch_from": "feat",
                "action_id": 42,
                "github_metadata": { "commit_sha": "abcdef123" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body
    }

    async fn deliver(app: &Router, event: &str, payload: &Value, secret: &str) -> StatusCode {
        let bytes = payload.to_string();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/github/incoming_webhook/uid-test")
            .header("x-github-event", event)
            .header("x-hub-signature-256", sign(secret, bytes.as_bytes()))
            .header("content-type", "application/json")
            .body(Body::from(bytes))
            .unwrap();
        app.clone().oneshot(request).await.unwrap().status()
    }

    fn pull_request_payload(action: &str, installation_id: i64) -> Value {
        json!({
            "action": action,
            "number": 7,
            "pull_request": {
                "title": "Add feature",
                "head": { "ref": "feat" },
                "base": { "ref": "main" }
            },
            "repository": { "name": "web", "owner": { "login": "acme" } },
            "installation": { "id": installation_id }
        })
    }

    #[tokio::test]
    async fn cluster_scoped_lookups_by_repository_and_namespace() {
        let t = test_app().await;
        let created = create_pr_7(&t).await;

        let (status, env) = send(
            &t.app,
            Method::GET,
            "/projects/1/clusters/1/repositories/acme/web/environment",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{env}");
        assert_eq!(env["id"], t.env.id);

        let (status, deployment) =
            send(&t.app, Method::GET, "/projects/1/clusters/1/namespaces/pr-7/deployment", None).await;
        assert_eq!(status, StatusCode::OK, "{deployment}");
        assert_eq!(deployment["id"], created["id"]);

        let (status, _) =
            send(&t.app, Method::GET, "/projects/1/clusters/1/namespaces/pr-8/deployment", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_then_finalize() {
        let t = test_app().await;
        let created = create_pr_7(&t).await;
        assert_eq!(created["status"], "creating");
        assert_eq!(created["namespace"], "pr-7");

        let (status, body) = send(
            &t.app,
            Method::POST,
            &format!("{REPO_URI}/deployments/finalize"),
            Some(json!({ "namespace": "pr-7", "subdomain": "x.example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "created");
        assert_eq!(body["subdomain"], "x.example.com");
    }

    #[tokio::test]
    async fn closed_pull_request_is_a_conflict() {
        let t = test_app().await;
        t.scm.set_pull(7, "feat", PullRequestState::Closed);

        let (status, body) = send(
            &t.app,
            Method::POST,
            &format!("{REPO_URI}/deployments"),
            Some(json!({ "namespace": "pr-7", "pull_request_id": 7, "pr_branch_from": "feat" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], PR_CLOSED);
    }

    #[tokio::test]
    async fn finalize_without_selector_is_a_bad_request() {
        let t = test_app().await;
        create_pr_7(&t).await;

        let (status, _) = send(
            &t.app,
            Method::POST,
            &format!("{REPO_URI}/deployments/finalize"),
            Some(json!({ "subdomain": "x.example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_status_is_a_bad_request() {
        let t = test_app().await;
        let created = create_pr_7(&t).await;
        let id = created["id"].as_i64().unwrap();

        let (status, _) = send(
            &t.app,
            Method::PUT,
            &format!("/projects/1/clusters/1/deployments/{id}/status"),
            Some(json!({ "status": "deleted" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trigger_while_running_is_a_conflict() {
        let t = test_app().await;
        let created = create_pr_7(&t).await;
        let id = created["id"].as_i64().unwrap();
        send(
            &t.app,
            Method::PUT,
            &format!("/projects/1/clusters/1/deployments/{id}/finalize"),
            Some(json!({ "subdomain": "" })),
        )
        .await;
        t.scm.push_run(3, "queued");

        let (status, _) = send(
            &t.app,
            Method::POST,
            &format!("/projects/1/clusters/1/deployments/{id}/trigger_workflow"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(t.scm.state().dispatches.is_empty());
    }

    #[tokio::test]
    async fn cluster_listing_filters_by_status() {
        let t = test_app().await;
        create_pr_7(&t).await;

        let (status, body) = send(&t.app, Method::GET, "/projects/1/clusters/1/deployments?status=creating", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = send(&t.app, Method::GET, "/projects/1/clusters/1/deployments?status=created,failed", None).await;
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = send(&t.app, Method::GET, "/projects/1/clusters/1/deployments?status=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bind_returns_the_service_token_once() {
        let t = test_app().await;
        let (status, body) = send(
            &t.app,
            Method::POST,
            "/projects/1/clusters/1/gitrepos/9/acme/api/environments",
            Some(json!({ "name": "preview", "mode": "auto", "git_repo_branches": ["main"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert!(body["service_token"].as_str().is_some_and(|t| !t.is_empty()));
        assert!(body.get("webhook_uid").is_none());
        let env_id = body["id"].as_i64().unwrap();

        let (status, body) = send(
            &t.app,
            Method::GET,
            &format!("/projects/1/clusters/1/environments/{env_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("service_token").is_none());
        assert_eq!(body["mode"], "auto");
    }

    #[tokio::test]
    async fn manifest_validation_reports_missing_file() {
        let t = test_app().await;
        let (status, body) = send(
            &t.app,
            Method::POST,
            &format!("/projects/1/clusters/1/environments/{}/validate_porter_yaml", t.env.id),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "errors": ["NO_MANIFEST"] }));
    }

    #[tokio::test]
    async fn webhook_rejects_bad_signatures() {
        let t = test_app().await;
        let status = deliver(&t.app, "ping", &json!({}), "wrong-secret").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_accepts_pings_and_unrelated_events() {
        let t = test_app().await;
        assert_eq!(deliver(&t.app, "ping", &json!({ "zen": "hi" }), SECRET).await, StatusCode::OK);
        assert_eq!(deliver(&t.app, "push", &json!({}), SECRET).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn closed_webhook_tombstones_the_deployment() {
        let t = test_app().await;
        create_pr_7(&t).await;

        let status = deliver(&t.app, "pull_request", &pull_request_payload("closed", 9), SECRET).await;
        assert_eq!(status, StatusCode::OK);

        let stored = t.store.read_deployment(t.env.id, "pr-7").await.unwrap();
        assert_eq!(stored.status, crate::models::deployment::DeploymentStatus::Inactive);
    }

    #[tokio::test]
    async fn webhook_from_another_installation_is_rejected() {
        let t = test_app().await;
        let status = deliver(&t.app, "pull_request", &pull_request_payload("opened", 10), SECRET).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(t.scm.state().dispatches.is_empty());
    }
}
