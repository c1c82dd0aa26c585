//! GitHub webhook receiver: authenticates `pull_request` deliveries and hands
//! them to the deployment lifecycle.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;

use super::AppState;
use crate::error::{PreviewError, PreviewResult};
use crate::services::deployment_service::{PullRequestEvent, WebhookOutcome};
use crate::services::github::signature::validate_signature;

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: String,
    number: i64,
    pull_request: PullRequestBody,
    repository: Repository,
    #[serde(default)]
    installation: Option<Installation>,
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    #[serde(default)]
    title: String,
    head: GitRef,
    base: GitRef,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    #[serde(rename = "ref")]
    git_ref: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    owner: Owner,
}

#[derive(Debug, Deserialize)]
struct Owner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Installation {
    id: i64,
}

/// Handle a delivery to the webhook of environment `webhook_uid`.
pub async fn handle_webhook(
    state: &AppState,
    webhook_uid: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> PreviewResult<StatusCode> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !validate_signature(&state.webhook_secret, &body, signature) {
        tracing::warn!(webhook_uid, "Webhook signature validation failed");
        return Err(PreviewError::Unauthenticated("invalid webhook signature".to_string()));
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    match event_type {
        "pull_request" => handle_pull_request(state, webhook_uid, &body).await,
        "ping" => {
            tracing::info!(webhook_uid, "Received GitHub ping webhook");
            Ok(StatusCode::OK)
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            Ok(StatusCode::OK)
        }
    }
}

async fn handle_pull_request(state: &AppState, webhook_uid: &str, body: &[u8]) -> PreviewResult<StatusCode> {
    let payload: PullRequestPayload = serde_json::from_slice(body)
        .map_err(|e| PreviewError::BadRequest(format!("malformed pull_request payload: {e}")))?;

    let env = state
        .store
        .read_environment_by_webhook_id(webhook_uid, &payload.repository.owner.login, &payload.repository.name)
        .await?;

    if let Some(installation) = &payload.installation {
        if installation.id != env.git_installation_id {
            tracing::warn!(
                environment_id = env.id,
                installation_id = installation.id,
                "Webhook installation does not match environment"
            );
            return Err(PreviewError::BadRequest(
                "installation id does not match the environment".to_string(),
            ));
        }
    }

    let event = PullRequestEvent {
        action: payload.action,
        number: payload.number,
        title: payload.pull_request.title,
        head_ref: payload.pull_request.head.git_ref,
        base_ref: payload.pull_request.base.git_ref,
    };

    match state.deployments.handle_pull_request(&env, &event).await? {
        WebhookOutcome::Ignored(reason) => {
            tracing::debug!(environment_id = env.id, pr_number = event.number, action = %event.action, reason, "Webhook ignored");
        }
        outcome => {
            tracing::info!(environment_id = env.id, pr_number = event.number, ?outcome, "Webhook handled");
        }
    }
    Ok(StatusCode::OK)
}
