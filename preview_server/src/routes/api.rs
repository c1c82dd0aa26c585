//! REST handlers for environments and deployments.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::{PreviewError, PreviewResult};
use crate::models::deployment::{Deployment, DeploymentStatus};
use crate::models::environment::{Environment, EnvironmentKey};
use crate::models::revision::DeploymentRevision;
use crate::services::deployment_service::{CreateDeploymentRequest, DeploymentSelector, Located, RebuildRequest};
use crate::services::environment_service::{BindRequest, BoundEnvironment, SettingsRequest};

const USER_HEADER: &str = "x-user-id";

// ── Paths ──

#[derive(Debug, Deserialize)]
pub struct RepoPath {
    pub project_id: i64,
    pub cluster_id: i64,
    pub installation_id: i64,
    pub owner: String,
    pub name: String,
}

impl RepoPath {
    fn key(&self) -> EnvironmentKey {
        EnvironmentKey {
            project_id: self.project_id,
            cluster_id: self.cluster_id,
            installation_id: self.installation_id,
            owner: self.owner.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClusterPath {
    pub project_id: i64,
    pub cluster_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPath {
    pub project_id: i64,
    pub cluster_id: i64,
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct NamespacePath {
    pub project_id: i64,
    pub cluster_id: i64,
    pub namespace: String,
}

#[derive(Debug, Deserialize)]
pub struct EnvironmentPath {
    pub project_id: i64,
    pub cluster_id: i64,
    pub environment_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeploymentPath {
    pub project_id: i64,
    pub cluster_id: i64,
    pub deployment_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct EnvironmentDeploymentPath {
    pub project_id: i64,
    pub cluster_id: i64,
    pub environment_id: i64,
    pub deployment_id: i64,
}

// ── Bodies ──

#[derive(Debug, Deserialize)]
pub struct SelectedRebuild {
    #[serde(flatten)]
    pub selector: DeploymentSelector,
    #[serde(flatten)]
    pub rebuild: RebuildRequest,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    #[serde(flatten)]
    pub selector: DeploymentSelector,
    #[serde(default)]
    pub subdomain: String,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeErrorsRequest {
    #[serde(flatten)]
    pub selector: DeploymentSelector,
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
    #[serde(default)]
    pub successful_resources: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    #[serde(flatten)]
    pub selector: DeploymentSelector,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ToggleCommentRequest {
    pub disable: bool,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs_url: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusFilter {
    /// Comma-separated statuses; absent lists all.
    pub status: Option<String>,
}

fn parse_status(raw: &str) -> PreviewResult<DeploymentStatus> {
    DeploymentStatus::parse(raw.trim())
        .ok_or_else(|| PreviewError::BadRequest(format!("unknown deployment status '{raw}'")))
}

fn parse_filter(filter: &StatusFilter) -> PreviewResult<Vec<DeploymentStatus>> {
    match filter.status.as_deref() {
        None | Some("") => Ok(Vec::new()),
        Some(raw) => raw.split(',').map(parse_status).collect(),
    }
}

fn user_id(headers: &HeaderMap) -> &str {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
}

async fn locate_deployment(state: &AppState, path: &DeploymentPath) -> PreviewResult<Located> {
    state
        .deployments
        .locate_by_id(path.project_id, path.cluster_id, path.deployment_id)
        .await
}

async fn environment(state: &AppState, path: &EnvironmentPath) -> PreviewResult<Environment> {
    state
        .environments
        .get_by_id(path.project_id, path.cluster_id, path.environment_id)
        .await
}

// ── Environments (by repository) ──

pub async fn bind_environment(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
    headers: HeaderMap,
    Json(req): Json<BindRequest>,
) -> PreviewResult<(StatusCode, Json<BoundEnvironment>)> {
    let bound = state.environments.bind(&path.key(), req, user_id(&headers)).await?;
    Ok((StatusCode::CREATED, Json(bound)))
}

pub async fn get_environment(State(state): State<AppState>, Path(path): Path<RepoPath>) -> PreviewResult<Json<Environment>> {
    state.environments.get(&path.key()).await.map(Json)
}

pub async fn unbind_environment(State(state): State<AppState>, Path(path): Path<RepoPath>) -> PreviewResult<StatusCode> {
    state.environments.unbind(&path.key()).await?;
    Ok(StatusCode::OK)
}

// ── Environments (by cluster) ──

pub async fn list_environments(
    State(state): State<AppState>,
    Path(path): Path<ClusterPath>,
) -> PreviewResult<Json<Vec<Environment>>> {
    state
        .environments
        .list(path.project_id, path.cluster_id)
        .await
        .map(Json)
}

pub async fn get_environment_by_repository(
    State(state): State<AppState>,
    Path(path): Path<RepositoryPath>,
) -> PreviewResult<Json<Environment>> {
    state
        .environments
        .get_by_repo(path.project_id, path.cluster_id, &path.owner, &path.name)
        .await
        .map(Json)
}

pub async fn get_environment_by_id(
    State(state): State<AppState>,
    Path(path): Path<EnvironmentPath>,
) -> PreviewResult<Json<Environment>> {
    environment(&state, &path).await.map(Json)
}

pub async fn update_settings(
    State(state): State<AppState>,
    Path(path): Path<EnvironmentPath>,
    Json(req): Json<SettingsRequest>,
) -> PreviewResult<Json<Environment>> {
    let env = environment(&state, &path).await?;
    state.environments.update_settings(env, req).await.map(Json)
}

pub async fn toggle_new_comment(
    State(state): State<AppState>,
    Path(path): Path<EnvironmentPath>,
    Json(req): Json<ToggleCommentRequest>,
) -> PreviewResult<Json<Environment>> {
    let env = environment(&state, &path).await?;
    state.environments.toggle_new_comment(env, req.disable).await.map(Json)
}

pub async fn validate_porter_yaml(
    State(state): State<AppState>,
    Path(path): Path<EnvironmentPath>,
    body: Option<Json<ValidateRequest>>,
) -> PreviewResult<Json<ValidateResponse>> {
    let env = environment(&state, &path).await?;
    let branch = body.and_then(|Json(req)| req.branch);
    let errors = state
        .environments
        .validate_manifest(&env, branch.as_deref())
        .await?;
    Ok(Json(ValidateResponse { errors }))
}

pub async fn list_environment_deployments(
    State(state): State<AppState>,
    Path(path): Path<EnvironmentPath>,
) -> PreviewResult<Json<Vec<Deployment>>> {
    let env = environment(&state, &path).await?;
    state.deployments.list(&env).await.map(Json)
}

pub async fn get_environment_deployment(
    State(state): State<AppState>,
    Path(path): Path<EnvironmentDeploymentPath>,
) -> PreviewResult<Json<Deployment>> {
    let located = state
        .deployments
        .locate_in_environment_by_id(path.project_id, path.cluster_id, path.environment_id, path.deployment_id)
        .await?;
    Ok(Json(located.deployment))
}

// ── Deployments (CI callbacks, by repository) ──

pub async fn create_deployment(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
    Json(req): Json<CreateDeploymentRequest>,
) -> PreviewResult<Json<Deployment>> {
    let env = state.environments.get(&path.key()).await?;
    state.deployments.create(&env, req).await.map(Json)
}

pub async fn list_repo_deployments(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
) -> PreviewResult<Json<Vec<Deployment>>> {
    let env = state.environments.get(&path.key()).await?;
    state.deployments.list(&env).await.map(Json)
}

pub async fn get_selected_deployment(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
    Query(selector): Query<DeploymentSelector>,
) -> PreviewResult<Json<Deployment>> {
    let located = state.deployments.locate(&path.key(), &selector).await?;
    Ok(Json(located.deployment))
}

pub async fn update_selected_deployment(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
    Json(req): Json<SelectedRebuild>,
) -> PreviewResult<Json<Deployment>> {
    let located = state.deployments.locate(&path.key(), &req.selector).await?;
    state.deployments.update(located, req.rebuild).await.map(Json)
}

pub async fn finalize_selected_deployment(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
    Json(req): Json<FinalizeRequest>,
) -> PreviewResult<Json<Deployment>> {
    let located = state.deployments.locate(&path.key(), &req.selector).await?;
    state
        .deployments
        .finalize_success(located, &req.subdomain)
        .await
        .map(Json)
}

pub async fn finalize_selected_errors(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
    Json(req): Json<FinalizeErrorsRequest>,
) -> PreviewResult<Json<Deployment>> {
    let located = state.deployments.locate(&path.key(), &req.selector).await?;
    state
        .deployments
        .finalize_errors(located, &req.errors, &req.successful_resources)
        .await
        .map(Json)
}

pub async fn update_selected_status(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
    Json(req): Json<StatusRequest>,
) -> PreviewResult<Json<Deployment>> {
    let target = parse_status(&req.status)?;
    let located = state.deployments.locate(&path.key(), &req.selector).await?;
    state.deployments.update_status(located, target).await.map(Json)
}

pub async fn delete_selected_deployment(
    State(state): State<AppState>,
    Path(path): Path<RepoPath>,
    Query(selector): Query<DeploymentSelector>,
) -> PreviewResult<StatusCode> {
    let located = state.deployments.locate(&path.key(), &selector).await?;
    state.deployments.delete(located).await?;
    Ok(StatusCode::OK)
}

// ── Deployments (by cluster) ──

pub async fn list_cluster_deployments(
    State(state): State<AppState>,
    Path(path): Path<ClusterPath>,
    Query(filter): Query<StatusFilter>,
) -> PreviewResult<Json<Vec<Deployment>>> {
    let statuses = parse_filter(&filter)?;
    state
        .deployments
        .list_by_cluster(path.project_id, path.cluster_id, &statuses)
        .await
        .map(Json)
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
) -> PreviewResult<Json<Deployment>> {
    Ok(Json(locate_deployment(&state, &path).await?.deployment))
}

pub async fn get_deployment_by_namespace(
    State(state): State<AppState>,
    Path(path): Path<NamespacePath>,
) -> PreviewResult<Json<Deployment>> {
    let located = state
        .deployments
        .locate_by_namespace(path.project_id, path.cluster_id, &path.namespace)
        .await?;
    Ok(Json(located.deployment))
}

pub async fn update_deployment(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
    Json(req): Json<RebuildRequest>,
) -> PreviewResult<Json<Deployment>> {
    let located = locate_deployment(&state, &path).await?;
    state.deployments.update(located, req).await.map(Json)
}

pub async fn finalize_deployment(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
    Json(req): Json<FinalizeRequest>,
) -> PreviewResult<Json<Deployment>> {
    let located = locate_deployment(&state, &path).await?;
    state
        .deployments
        .finalize_success(located, &req.subdomain)
        .await
        .map(Json)
}

pub async fn finalize_deployment_errors(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
    Json(req): Json<FinalizeErrorsRequest>,
) -> PreviewResult<Json<Deployment>> {
    let located = locate_deployment(&state, &path).await?;
    state
        .deployments
        .finalize_errors(located, &req.errors, &req.successful_resources)
        .await
        .map(Json)
}

pub async fn update_deployment_status(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
    Json(req): Json<StatusRequest>,
) -> PreviewResult<Json<Deployment>> {
    let target = parse_status(&req.status)?;
    let located = locate_deployment(&state, &path).await?;
    state.deployments.update_status(located, target).await.map(Json)
}

pub async fn reenable_deployment(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
) -> PreviewResult<Json<Deployment>> {
    let located = locate_deployment(&state, &path).await?;
    state.deployments.reenable(located).await.map(Json)
}

pub async fn trigger_workflow(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
) -> PreviewResult<Json<Deployment>> {
    let located = locate_deployment(&state, &path).await?;
    state.deployments.trigger_workflow(located).await.map(Json)
}

pub async fn delete_deployment(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
) -> PreviewResult<StatusCode> {
    let located = locate_deployment(&state, &path).await?;
    state.deployments.delete(located).await?;
    Ok(StatusCode::OK)
}

pub async fn deployment_revisions(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
) -> PreviewResult<Json<Vec<DeploymentRevision>>> {
    let located = locate_deployment(&state, &path).await?;
    state.deployments.revisions(&located).await.map(Json)
}

pub async fn deployment_logs(
    State(state): State<AppState>,
    Path(path): Path<DeploymentPath>,
) -> PreviewResult<Json<LogsResponse>> {
    let located = locate_deployment(&state, &path).await?;
    let logs_url = state.deployments.logs_url(&located).await?;
    Ok(Json(LogsResponse { logs_url }))
}
