//! Deployment lifecycle: create, rebuild, finalize, status transitions,
//! workflow triggers and teardown, kept consistent across the store,
//! GitHub and the cluster.
//!
//! Every read-modify-write of a deployment row goes through
//! [`DeploymentOrchestrator::mutate`], which retries on stale versions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use super::cluster::{ClusterConnector, ClusterError};
use super::comment::{comments_enabled, render_failure, render_success, CommentComposer};
use super::github::{
    latest_workflow_run, DeploymentState, DeploymentStatusUpdate, DispatchInputs, NewScmDeployment, PullRequest,
    ScmError, SourceControl,
};
use super::manifest::{validate_branch, MANIFEST_PATH};
use crate::error::{PreviewError, PreviewResult};
use crate::models::deployment::{is_protected_namespace, Deployment, DeploymentStatus, GitHubMetadata, NewDeployment};
use crate::models::environment::{Environment, EnvironmentKey, EnvironmentMode, RepoRef};
use crate::models::revision::DeploymentRevision;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDeploymentRequest {
    pub namespace: String,
    #[serde(default)]
    pub pull_request_id: i64,
    #[serde(default)]
    pub pr_branch_from: String,
    #[serde(default)]
    pub action_id: i64,
    #[serde(default)]
    pub github_metadata: GitHubMetadata,
}

/// Identifies a deployment inside an environment by namespace, PR number or,
/// for branch deploys, the branch name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentSelector {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub pr_number: Option<i64>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RebuildRequest {
    #[serde(default)]
    pub pr_branch_from: Option<String>,
    #[serde(default)]
    pub action_id: i64,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub pr_name: Option<String>,
}

/// A deployment together with the environment that owns it.
#[derive(Debug, Clone)]
pub struct Located {
    pub env: Environment,
    pub deployment: Deployment,
}

/// A `pull_request` webhook delivery, reduced to what drives the lifecycle.
#[derive(Debug, Clone)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: i64,
    pub title: String,
    pub head_ref: String,
    pub base_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Dispatched,
    Closed,
    Ignored(&'static str),
}

/// `https://` is assumed when the subdomain carries no scheme.
pub fn environment_url(subdomain: &str) -> String {
    if subdomain.starts_with("http://") || subdomain.starts_with("https://") {
        subdomain.to_string()
    } else {
        format!("https://{subdomain}")
    }
}

fn transition(d: &mut Deployment, to: DeploymentStatus) -> PreviewResult<()> {
    if !d.status.can_transition_to(to) {
        return Err(PreviewError::Conflict(format!(
            "deployment {} cannot move from {} to {}",
            d.id, d.status, to
        )));
    }
    d.status = to;
    Ok(())
}

fn inactive_conflict(d: &Deployment) -> PreviewError {
    PreviewError::Conflict(format!("deployment {} is inactive", d.id))
}

pub struct DeploymentOrchestrator {
    store: Arc<dyn Store>,
    scm: Arc<dyn SourceControl>,
    clusters: Arc<dyn ClusterConnector>,
    update_retries: u32,
}

impl DeploymentOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        scm: Arc<dyn SourceControl>,
        clusters: Arc<dyn ClusterConnector>,
        update_retries: u32,
    ) -> Self {
        Self {
            store,
            scm,
            clusters,
            update_retries,
        }
    }

    // ── Resolution ──

    pub async fn locate_by_id(&self, project_id: i64, cluster_id: i64, id: i64) -> PreviewResult<Located> {
        let deployment = self.store.read_deployment_by_id(project_id, cluster_id, id).await?;
        let env = self
            .store
            .read_environment_by_id(project_id, cluster_id, deployment.environment_id)
            .await?;
        Ok(Located { env, deployment })
    }

    /// Namespaces are unique within a cluster, so the namespace alone locates a deployment.
    pub async fn locate_by_namespace(&self, project_id: i64, cluster_id: i64, namespace: &str) -> PreviewResult<Located> {
        let deployment = self
            .store
            .read_deployment_by_cluster(project_id, cluster_id, namespace)
            .await?;
        let env = self
            .store
            .read_environment_by_id(project_id, cluster_id, deployment.environment_id)
            .await?;
        Ok(Located { env, deployment })
    }

    pub async fn locate_in_environment_by_id(
        &self,
        project_id: i64,
        cluster_id: i64,
        environment_id: i64,
        id: i64,
    ) -> PreviewResult<Located> {
        let located = self.locate_by_id(project_id, cluster_id, id).await?;
        if located.env.id != environment_id {
            return Err(StoreError::NotFound("deployment").into());
        }
        Ok(located)
    }

    pub async fn locate(&self, key: &EnvironmentKey, selector: &DeploymentSelector) -> PreviewResult<Located> {
        let env = self.store.read_environment(key).await?;
        let deployment = self.find_in_environment(&env, selector).await?;
        Ok(Located { env, deployment })
    }

    async fn find_in_environment(&self, env: &Environment, selector: &DeploymentSelector) -> PreviewResult<Deployment> {
        if let Some(namespace) = selector.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            return Ok(self.store.read_deployment(env.id, namespace).await?);
        }
        if let Some(pr_number) = selector.pr_number.filter(|n| *n > 0) {
            return Ok(self
                .store
                .read_deployment_by_git_details(env.id, &env.git_repo_owner, &env.git_repo_name, pr_number)
                .await?);
        }
        if let Some(branch) = selector.branch.as_deref().filter(|b| !b.is_empty()) {
            return Ok(self
                .store
                .read_deployment_for_branch(env.id, &env.git_repo_owner, &env.git_repo_name, branch)
                .await?);
        }
        Err(PreviewError::BadRequest(
            "one of namespace, pr_number or branch must be present".to_string(),
        ))
    }

    // ── Create / rebuild ──

    /// Create a deployment for an open pull request (or a branch) and record it
    /// in `creating`. An inactive row for the same namespace is revived.
    pub async fn create(&self, env: &Environment, req: CreateDeploymentRequest) -> PreviewResult<Deployment> {
        let namespace = req.namespace.trim().to_string();
        if namespace.is_empty() {
            return Err(PreviewError::BadRequest("namespace is required".to_string()));
        }
        if is_protected_namespace(&namespace) {
            return Err(PreviewError::BadRequest(format!(
                "namespace {namespace} is a protected system namespace"
            )));
        }
        if req.pull_request_id == 0 && req.pr_branch_from.is_empty() {
            return Err(PreviewError::BadRequest(
                "pr_branch_from is required for branch deployments".to_string(),
            ));
        }

        let repo = env.repo();
        let mut metadata = req.github_metadata;
        if metadata.repo_owner.is_empty() {
            metadata.repo_owner = env.git_repo_owner.clone();
        }
        if metadata.repo_name.is_empty() {
            metadata.repo_name = env.git_repo_name.clone();
        }

        let mut git_ref = req.pr_branch_from;
        if req.pull_request_id != 0 {
            let pr = self.ensure_pr_open(&repo, req.pull_request_id).await?;
            if git_ref.is_empty() {
                git_ref = pr.head_ref.clone();
            }
            fill_from_pull_request(&mut metadata, &pr);
        }

        let existing = match self.store.read_deployment(env.id, &namespace).await {
            Ok(d) if d.status != DeploymentStatus::Inactive => {
                return Err(PreviewError::Conflict(format!(
                    "deployment for namespace {namespace} already exists"
                )))
            }
            Ok(d) => Some(d),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let gh_deployment_id = self
            .scm
            .create_deployment(
                &repo,
                &NewScmDeployment {
                    git_ref: git_ref.clone(),
                    action_id: req.action_id,
                    environment_name: env.name.clone(),
                },
            )
            .await?;

        let recorded = match existing {
            None => self
                .store
                .create_deployment(NewDeployment {
                    environment_id: env.id,
                    namespace: namespace.clone(),
                    status: DeploymentStatus::Creating,
                    pull_request_id: req.pull_request_id,
                    pr_branch_from: git_ref.clone(),
                    gh_deployment_id,
                    github_metadata: metadata.clone(),
                })
                .await
                .map_err(PreviewError::from),
            Some(inactive) => {
                self.mutate(&inactive, |d| {
                    transition(d, DeploymentStatus::Creating)?;
                    d.gh_deployment_id = gh_deployment_id;
                    d.pr_branch_from = git_ref.clone();
                    d.github_metadata = metadata.clone();
                    d.subdomain = None;
                    d.last_errors.clear();
                    Ok(true)
                })
                .await
            }
        };

        let deployment = match recorded {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(
                    environment_id = env.id,
                    namespace = %namespace,
                    gh_deployment_id,
                    "Failed to record deployment: {e}"
                );
                self.compensate_scm_deployment(repo, gh_deployment_id).await;
                return Err(PreviewError::Internal(format!("recording deployment: {e}")));
            }
        };

        crate::metrics::deployment_transition(DeploymentStatus::Creating.as_str());
        tracing::info!(
            environment_id = env.id,
            deployment_id = deployment.id,
            namespace = %deployment.namespace,
            pr_number = deployment.pull_request_id,
            "Deployment created"
        );

        self.ensure_namespace(env, &deployment.namespace).await;
        Ok(deployment)
    }

    /// Rebuild trigger: a new GitHub deployment for a new commit.
    pub async fn update(&self, located: Located, req: RebuildRequest) -> PreviewResult<Deployment> {
        let Located { env, deployment } = located;
        if deployment.status == DeploymentStatus::Inactive {
            return Err(inactive_conflict(&deployment));
        }

        let repo = env.repo();
        if !deployment.is_branch_deploy() {
            self.ensure_pr_open(&repo, deployment.pull_request_id).await?;
        }

        let git_ref = req
            .pr_branch_from
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| deployment.pr_branch_from.clone());

        let gh_deployment_id = self
            .scm
            .create_deployment(
                &repo,
                &NewScmDeployment {
                    git_ref: git_ref.clone(),
                    action_id: req.action_id,
                    environment_name: env.name.clone(),
                },
            )
            .await?;

        let updated = self
            .mutate(&deployment, |d| {
                if d.status == DeploymentStatus::Inactive {
                    return Err(inactive_conflict(d));
                }
                transition(d, DeploymentStatus::Updating)?;
                d.gh_deployment_id = gh_deployment_id;
                d.pr_branch_from = git_ref.clone();
                if !req.commit_sha.is_empty() {
                    d.github_metadata.commit_sha = req.commit_sha.clone();
                }
                if let Some(name) = req.pr_name.as_ref().filter(|n| !n.is_empty()) {
                    d.github_metadata.pr_name = name.clone();
                }
                Ok(true)
            })
            .await;

        match updated {
            Ok(d) => Ok(d),
            Err(e) => {
                self.compensate_scm_deployment(repo, gh_deployment_id).await;
                Err(e)
            }
        }
    }

    // ── Finalize ──

    /// Success path: the row moves to `created` first; the status post and the
    /// comment follow. Their failures are reported without undoing the row.
    pub async fn finalize_success(&self, located: Located, subdomain: &str) -> PreviewResult<Deployment> {
        let Located { env, deployment } = located;
        let subdomain = subdomain.trim().to_string();

        let updated = self
            .mutate(&deployment, |d| {
                if d.status == DeploymentStatus::Inactive {
                    return Err(inactive_conflict(d));
                }
                transition(d, DeploymentStatus::Created)?;
                d.subdomain = (!subdomain.is_empty()).then(|| subdomain.clone());
                d.last_errors.clear();
                Ok(true)
            })
            .await?;

        let repo = env.repo();
        let mut failure: Option<PreviewError> = None;

        if updated.gh_deployment_id != 0 {
            let mut status = DeploymentStatusUpdate::new(DeploymentState::Success);
            status.environment_url = updated.subdomain.as_deref().map(environment_url);
            if let Err(e) = self
                .scm
                .create_deployment_status(&repo, updated.gh_deployment_id, &status)
                .await
            {
                tracing::error!(deployment_id = updated.id, "Failed to post success status: {e}");
                failure = Some(PreviewError::Upstream(format!("posting deployment status: {e}")));
            }
        }

        let mut result = updated;
        if comments_enabled(&env, &result) {
            match self.scm.get_pull_request(&repo, result.pull_request_id).await {
                Ok(pr) if !pr.is_open() => {
                    tracing::debug!(
                        deployment_id = result.id,
                        pr_number = result.pull_request_id,
                        "Pull request closed, skipping comment"
                    );
                }
                Ok(_) => {
                    let body = render_success(
                        &env.git_repo_owner,
                        &env.git_repo_name,
                        result.commit_sha(),
                        result.subdomain.as_deref().map(environment_url).as_deref(),
                    );
                    match self.upsert_comment(&env, &result, &body).await {
                        Ok(d) => result = d,
                        Err(e) => {
                            failure.get_or_insert(e);
                        }
                    }
                }
                Err(e) => {
                    failure.get_or_insert(e.into());
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Failure path: records `errors` (resource -> message) and moves the row to `failed`.
    pub async fn finalize_errors(
        &self,
        located: Located,
        errors: &BTreeMap<String, String>,
        successful_resources: &[String],
    ) -> PreviewResult<Deployment> {
        let Located { env, deployment } = located;
        if errors.is_empty() {
            return Err(PreviewError::BadRequest("errors must not be empty".to_string()));
        }

        let last_errors = errors
            .iter()
            .map(|(resource, message)| format!("{resource}: {message}"))
            .collect::<Vec<_>>()
            .join("\n");

        let updated = self
            .mutate(&deployment, |d| {
                if d.status == DeploymentStatus::Inactive {
                    return Err(inactive_conflict(d));
                }
                transition(d, DeploymentStatus::Failed)?;
                d.last_errors = last_errors.clone();
                Ok(true)
            })
            .await?;

        let repo = env.repo();
        if updated.gh_deployment_id != 0 {
            let status = DeploymentStatusUpdate::new(DeploymentState::Failure);
            if let Err(e) = self
                .scm
                .create_deployment_status(&repo, updated.gh_deployment_id, &status)
                .await
            {
                tracing::warn!(deployment_id = updated.id, "Failed to post failure status: {e}");
            }
        }

        if !comments_enabled(&env, &updated) {
            return Ok(updated);
        }

        self.ensure_pr_open(&repo, updated.pull_request_id).await?;

        let logs_url = match latest_workflow_run(
            self.scm.as_ref(),
            &repo,
            &env.workflow_file_name(),
            &updated.pr_branch_from,
        )
        .await
        {
            Ok(run) => run.map(|r| r.html_url),
            Err(e) => {
                tracing::warn!(deployment_id = updated.id, "Could not look up workflow run: {e}");
                None
            }
        };

        let body = render_failure(
            &env.git_repo_owner,
            &env.git_repo_name,
            updated.commit_sha(),
            logs_url.as_deref(),
            errors,
            successful_resources,
        );
        self.upsert_comment(&env, &updated, &body).await
    }

    async fn upsert_comment(&self, env: &Environment, deployment: &Deployment, body: &str) -> PreviewResult<Deployment> {
        let comment_id = CommentComposer::new(self.scm.as_ref())
            .upsert(env, deployment, body)
            .await
            .map_err(|e| PreviewError::Upstream(format!("updating pull request comment: {e}")))?;

        if comment_id == deployment.gh_pr_comment_id {
            return Ok(deployment.clone());
        }
        self.mutate(deployment, |d| {
            d.gh_pr_comment_id = comment_id;
            Ok(true)
        })
        .await
    }

    // ── Status, re-enable, workflow ──

    /// Requests a status transition. An inactive deployment only accepts
    /// `creating`; any other target returns the row unchanged.
    pub async fn update_status(&self, located: Located, target: DeploymentStatus) -> PreviewResult<Deployment> {
        let deployment = located.deployment;
        if deployment.status == DeploymentStatus::Inactive && target != DeploymentStatus::Creating {
            return Ok(deployment);
        }

        self.mutate(&deployment, |d| {
            if d.status == target
                || (d.status == DeploymentStatus::Inactive && target != DeploymentStatus::Creating)
            {
                return Ok(false);
            }
            transition(d, target)?;
            Ok(true)
        })
        .await
    }

    /// Dispatch the workflow again for an inactive deployment whose branch still
    /// carries a valid manifest. The row is left as is; the CI callback recreates it.
    pub async fn reenable(&self, located: Located) -> PreviewResult<Deployment> {
        let Located { env, deployment } = located;
        if deployment.status != DeploymentStatus::Inactive {
            return Err(PreviewError::Conflict(format!(
                "deployment {} is {}; only inactive deployments can be re-enabled",
                deployment.id, deployment.status
            )));
        }

        let repo = env.repo();
        let pr = if deployment.is_branch_deploy() {
            None
        } else {
            Some(self.ensure_pr_open(&repo, deployment.pull_request_id).await?)
        };

        let defects = validate_branch(self.scm.as_ref(), &repo, Some(&deployment.pr_branch_from)).await?;
        if !defects.is_empty() {
            let listed = defects.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
            return Err(PreviewError::FailedPrecondition(format!(
                "{MANIFEST_PATH} on {} is not deployable: {listed}",
                deployment.pr_branch_from
            )));
        }

        self.dispatch(&env, &deployment, pr.as_ref()).await?;
        tracing::info!(deployment_id = deployment.id, namespace = %deployment.namespace, "Re-enable dispatched");
        Ok(deployment)
    }

    /// Re-run (or dispatch) the deployment's workflow and move it to `updating`.
    pub async fn trigger_workflow(&self, located: Located) -> PreviewResult<Deployment> {
        let Located { env, deployment } = located;
        if !deployment.status.can_trigger_workflow() {
            return Err(PreviewError::Conflict(format!(
                "deployment {} is {}; only created or failed deployments can be re-run",
                deployment.id, deployment.status
            )));
        }

        let repo = env.repo();
        let pr = if deployment.is_branch_deploy() {
            None
        } else {
            Some(self.ensure_pr_open(&repo, deployment.pull_request_id).await?)
        };

        let workflow_file = env.workflow_file_name();
        let latest = match latest_workflow_run(self.scm.as_ref(), &repo, &workflow_file, &deployment.pr_branch_from).await
        {
            Ok(run) => run,
            Err(ScmError::NotFound(_)) => {
                return Err(PreviewError::NotFound(format!("workflow file {workflow_file} not found")))
            }
            Err(e) => return Err(e.into()),
        };

        match latest {
            Some(run) if run.is_running() => {
                return Err(PreviewError::Conflict(
                    "a workflow run is already in progress or queued".to_string(),
                ))
            }
            Some(run) => match self.scm.rerun_workflow(&repo, run.id).await {
                Ok(()) => tracing::info!(deployment_id = deployment.id, run_id = run.id, "Workflow re-run requested"),
                Err(e) if e.status_code() == Some(403) => {
                    tracing::info!(run_id = run.id, "Run cannot be re-run, dispatching instead");
                    self.dispatch(&env, &deployment, pr.as_ref()).await?;
                }
                Err(e) => return Err(e.into()),
            },
            None => self.dispatch(&env, &deployment, pr.as_ref()).await?,
        }

        self.mutate(&deployment, |d| {
            if d.status == DeploymentStatus::Updating {
                return Ok(false);
            }
            transition(d, DeploymentStatus::Updating)?;
            Ok(true)
        })
        .await
    }

    async fn dispatch(&self, env: &Environment, deployment: &Deployment, pr: Option<&PullRequest>) -> PreviewResult<()> {
        let meta = &deployment.github_metadata;
        let inputs = DispatchInputs {
            pr_number: deployment.pull_request_id.to_string(),
            pr_title: match pr {
                Some(pr) if meta.pr_name.is_empty() => pr.title.clone(),
                _ => meta.pr_name.clone(),
            },
            pr_branch_from: deployment.pr_branch_from.clone(),
            pr_branch_into: match pr {
                Some(pr) if meta.pr_branch_into.is_empty() => pr.base_ref.clone(),
                _ => meta.pr_branch_into.clone(),
            },
        };
        self.scm
            .dispatch_workflow(&env.repo(), &env.workflow_file_name(), &deployment.pr_branch_from, &inputs)
            .await?;
        Ok(())
    }

    // ── Teardown ──

    /// Namespace first, then the row, then the GitHub deployment goes inactive.
    pub async fn delete(&self, located: Located) -> PreviewResult<()> {
        let Located { env, deployment } = located;

        self.delete_namespace(&env, &deployment.namespace).await?;
        self.store.delete_deployment(deployment.id).await?;
        tracing::info!(
            environment_id = env.id,
            deployment_id = deployment.id,
            namespace = %deployment.namespace,
            "Deployment deleted"
        );

        if deployment.gh_deployment_id != 0 {
            self.post_inactive(&env.repo(), &deployment).await;
        }
        Ok(())
    }

    /// Tombstone the deployment of a closed pull request.
    pub async fn close_pull_request(&self, env: &Environment, pr_number: i64) -> PreviewResult<Option<Deployment>> {
        let deployment = match self
            .store
            .read_deployment_by_git_details(env.id, &env.git_repo_owner, &env.git_repo_name, pr_number)
            .await
        {
            Ok(d) => d,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if deployment.status == DeploymentStatus::Inactive {
            return Ok(Some(deployment));
        }

        self.delete_namespace(env, &deployment.namespace).await?;
        let updated = self.deactivate(&deployment).await?;

        if updated.gh_deployment_id != 0 {
            self.post_inactive(&env.repo(), &updated).await;
        }
        Ok(Some(updated))
    }

    async fn deactivate(&self, deployment: &Deployment) -> PreviewResult<Deployment> {
        self.mutate(deployment, |d| {
            if d.status == DeploymentStatus::Inactive {
                return Ok(false);
            }
            transition(d, DeploymentStatus::Inactive)?;
            Ok(true)
        })
        .await
    }

    async fn delete_namespace(&self, env: &Environment, namespace: &str) -> PreviewResult<()> {
        let cluster = self.clusters.connect(env.project_id, env.cluster_id).await?;
        match cluster.delete_namespace(namespace).await {
            Ok(()) => Ok(()),
            Err(ClusterError::ProtectedNamespace(ns)) => {
                tracing::warn!(namespace = %ns, "Not deleting protected namespace");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-apply the environment's namespace labels to every live deployment.
    pub async fn relabel_namespaces(&self, env: &Environment) -> PreviewResult<()> {
        use DeploymentStatus::*;

        let live = self
            .store
            .list_deployments(env.id, &[Creating, Created, Updating, Failed])
            .await?;
        for d in live {
            self.ensure_namespace(env, &d.namespace).await;
        }
        Ok(())
    }

    async fn ensure_namespace(&self, env: &Environment, namespace: &str) {
        let result = match self.clusters.connect(env.project_id, env.cluster_id).await {
            Ok(cluster) => cluster.create_namespace(namespace, &env.namespace_labels).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(environment_id = env.id, namespace, "Could not prepare namespace: {e}");
        }
    }

    async fn post_inactive(&self, repo: &RepoRef, deployment: &Deployment) {
        let status = DeploymentStatusUpdate::new(DeploymentState::Inactive);
        if let Err(e) = self
            .scm
            .create_deployment_status(repo, deployment.gh_deployment_id, &status)
            .await
        {
            if e.is_not_found() {
                tracing::debug!(gh_deployment_id = deployment.gh_deployment_id, "GitHub deployment already gone");
            } else {
                tracing::warn!(deployment_id = deployment.id, "Failed to post inactive status: {e}");
            }
        }
    }

    // ── Reads ──

    /// Deployments of `env`. PR deployments whose pull request has closed
    /// without a webhook are tombstoned on the way out.
    pub async fn list(&self, env: &Environment) -> PreviewResult<Vec<Deployment>> {
        let deployments = self.store.list_deployments(env.id, &[]).await?;
        let repo = env.repo();

        let mut out = Vec::with_capacity(deployments.len());
        for d in deployments {
            if d.status == DeploymentStatus::Inactive || d.is_branch_deploy() {
                out.push(d);
                continue;
            }
            match self.scm.get_pull_request(&repo, d.pull_request_id).await {
                Ok(pr) if !pr.is_open() => match self.deactivate(&d).await {
                    Ok(tombstoned) => {
                        tracing::info!(deployment_id = d.id, pr_number = d.pull_request_id, "Tombstoned deployment of closed PR");
                        out.push(tombstoned);
                    }
                    Err(e) => {
                        tracing::warn!(deployment_id = d.id, "Could not tombstone deployment: {e}");
                        out.push(d);
                    }
                },
                Ok(_) => out.push(d),
                Err(e) => {
                    tracing::warn!(deployment_id = d.id, "Could not refresh pull request state: {e}");
                    out.push(d);
                }
            }
        }
        Ok(out)
    }

    pub async fn list_by_cluster(
        &self,
        project_id: i64,
        cluster_id: i64,
        statuses: &[DeploymentStatus],
    ) -> PreviewResult<Vec<Deployment>> {
        Ok(self
            .store
            .list_deployments_by_cluster(project_id, cluster_id, statuses)
            .await?)
    }

    pub async fn revisions(&self, located: &Located) -> PreviewResult<Vec<DeploymentRevision>> {
        Ok(self.store.list_deployment_revisions(located.deployment.id).await?)
    }

    /// Download URL of the latest workflow run's logs.
    pub async fn logs_url(&self, located: &Located) -> PreviewResult<String> {
        let repo = located.env.repo();
        let run = latest_workflow_run(
            self.scm.as_ref(),
            &repo,
            &located.env.workflow_file_name(),
            &located.deployment.pr_branch_from,
        )
        .await?
        .ok_or_else(|| PreviewError::NotFound("no workflow run found".to_string()))?;
        Ok(self.scm.get_workflow_run_logs_url(&repo, run.id).await?)
    }

    // ── Webhooks ──

    pub async fn handle_pull_request(&self, env: &Environment, event: &PullRequestEvent) -> PreviewResult<WebhookOutcome> {
        let auto = env.mode == EnvironmentMode::Auto && env.watches_branch(&event.base_ref);

        match event.action.as_str() {
            "opened" | "reopened" => {
                if !auto {
                    return Ok(WebhookOutcome::Ignored("environment does not auto-deploy this branch"));
                }
            }
            "synchronize" => {
                let live = match self
                    .store
                    .read_deployment_by_git_details(env.id, &env.git_repo_owner, &env.git_repo_name, event.number)
                    .await
                {
                    Ok(d) => d.status != DeploymentStatus::Inactive,
                    Err(StoreError::NotFound(_)) => false,
                    Err(e) => return Err(e.into()),
                };
                if !live && !auto {
                    return Ok(WebhookOutcome::Ignored("no live deployment for pull request"));
                }
            }
            "closed" => {
                self.close_pull_request(env, event.number).await?;
                return Ok(WebhookOutcome::Closed);
            }
            _ => return Ok(WebhookOutcome::Ignored("unhandled pull request action")),
        }

        let inputs = DispatchInputs {
            pr_number: event.number.to_string(),
            pr_title: event.title.clone(),
            pr_branch_from: event.head_ref.clone(),
            pr_branch_into: event.base_ref.clone(),
        };
        self.scm
            .dispatch_workflow(&env.repo(), &env.workflow_file_name(), &event.head_ref, &inputs)
            .await?;
        tracing::info!(
            environment_id = env.id,
            pr_number = event.number,
            action = %event.action,
            "Dispatched preview workflow"
        );
        Ok(WebhookOutcome::Dispatched)
    }

    // ── Internals ──

    async fn ensure_pr_open(&self, repo: &RepoRef, pr_number: i64) -> PreviewResult<PullRequest> {
        let pr = self.scm.get_pull_request(repo, pr_number).await?;
        if !pr.is_open() {
            return Err(PreviewError::pr_closed());
        }
        Ok(pr)
    }

    /// Delete a GitHub deployment whose row could not be written. Runs on its
    /// own task so it completes even if the request is abandoned.
    async fn compensate_scm_deployment(&self, repo: RepoRef, gh_deployment_id: i64) {
        crate::metrics::compensation("scm_deployment");
        let scm = self.scm.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = scm.delete_deployment(&repo, gh_deployment_id).await {
                tracing::warn!(gh_deployment_id, "Compensating deployment delete failed: {e}");
            }
        });
        if let Err(e) = task.await {
            tracing::warn!(gh_deployment_id, "Compensation task aborted: {e}");
        }
    }

    /// Read-modify-write of a deployment row under optimistic concurrency.
    ///
    /// `apply` edits a copy of the latest row and returns `false` to leave it
    /// untouched. On a stale version the row is re-read and `apply` runs again,
    /// up to the configured retry count.
    async fn mutate<F>(&self, current: &Deployment, mut apply: F) -> PreviewResult<Deployment>
    where
        F: FnMut(&mut Deployment) -> PreviewResult<bool> + Send,
    {
        let mut current = current.clone();
        let mut attempts = 0;

        loop {
            let mut next = current.clone();
            if !apply(&mut next)? {
                return Ok(current);
            }

            match self.store.update_deployment(&next).await {
                Ok(written) => {
                    if written.status != current.status {
                        crate::metrics::deployment_transition(written.status.as_str());
                        tracing::info!(
                            deployment_id = written.id,
                            namespace = %written.namespace,
                            from = %current.status,
                            status = %written.status,
                            "Deployment status changed"
                        );
                    }
                    return Ok(written);
                }
                Err(StoreError::StaleVersion { id, expected }) if attempts < self.update_retries => {
                    attempts += 1;
                    tracing::debug!(deployment_id = id, expected, attempts, "Stale deployment row, retrying");
                    current = self
                        .store
                        .read_deployment(current.environment_id, &current.namespace)
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn fill_from_pull_request(metadata: &mut GitHubMetadata, pr: &PullRequest) {
    if metadata.pr_name.is_empty() {
        metadata.pr_name = pr.title.clone();
    }
    if metadata.commit_sha.is_empty() {
        metadata.commit_sha = pr.head_sha.clone();
    }
    if metadata.pr_branch_into.is_empty() {
        metadata.pr_branch_into = pr.base_ref.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PR_CLOSED;
    use crate::services::github::{PullRequestState, RepoFile};
    use crate::services::testing::{seed_environment, FakeCluster, FakeClusters, FakeScm};
    use crate::store::memory::MemoryStore;

    const MANIFEST: &str = "version: v1stack\nbuild:\n  method: docker\n  dockerfile: Dockerfile\napps:\n  web:\n    type: web\n    run: ./server\n    port: 8080\n";

    struct Harness {
        store: Arc<MemoryStore>,
        scm: Arc<FakeScm>,
        cluster: Arc<FakeCluster>,
        orchestrator: DeploymentOrchestrator,
        env: Environment,
    }

    async fn harness(mode: EnvironmentMode) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let scm = FakeScm::new();
        let cluster = FakeCluster::new();
        let orchestrator = DeploymentOrchestrator::new(
            store.clone(),
            scm.clone(),
            Arc::new(FakeClusters(cluster.clone())),
            3,
        );
        let env = seed_environment(store.as_ref(), mode).await;
        Harness {
            store,
            scm,
            cluster,
            orchestrator,
            env,
        }
    }

    fn create_request(pr: i64) -> CreateDeploymentRequest {
        CreateDeploymentRequest {
            namespace: format!("pr-{pr}"),
            pull_request_id: pr,
            pr_branch_from: "feat".to_string(),
            action_id: 42,
            github_metadata: GitHubMetadata {
                commit_sha: "abcdef1234567".to_string(),
                ..Default::default()
            },
        }
    }

    impl Harness {
        async fn created(&self, pr: i64) -> Deployment {
            self.scm.open_pull(pr, "feat");
            self.orchestrator.create(&self.env, create_request(pr)).await.unwrap()
        }

        async fn located(&self, id: i64) -> Located {
            self.orchestrator.locate_by_id(1, 1, id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn create_records_a_creating_row_with_the_github_deployment() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;

        let created = h.scm.state().created_deployments.clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1.git_ref, "feat");
        assert_eq!(created[0].1.action_id, 42);

        assert_eq!(d.status, DeploymentStatus::Creating);
        assert_eq!(d.gh_deployment_id, created[0].0);
        assert_eq!(d.github_metadata.repo_owner, "acme");
        assert_eq!(d.github_metadata.pr_name, "PR 7");

        let stored = h.store.read_deployment(h.env.id, "pr-7").await.unwrap();
        assert_eq!(stored, d);
        assert!(h.cluster.state().namespaces.contains_key("pr-7"));
    }

    #[tokio::test]
    async fn failed_insert_deletes_the_github_deployment() {
        let h = harness(EnvironmentMode::Manual).await;
        h.scm.open_pull(7, "feat");
        h.store.fail_next_deployment_insert();

        let err = h.orchestrator.create(&h.env, create_request(7)).await.unwrap_err();
        assert!(matches!(err, PreviewError::Internal(_)));

        let state = h.scm.state();
        assert_eq!(state.deleted_deployments, vec![state.created_deployments[0].0]);
        drop(state);
        assert!(matches!(
            h.store.read_deployment(h.env.id, "pr-7").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn closed_pull_request_blocks_create_without_writes() {
        let h = harness(EnvironmentMode::Manual).await;
        h.scm.set_pull(7, "feat", PullRequestState::Closed);

        let err = h.orchestrator.create(&h.env, create_request(7)).await.unwrap_err();
        assert_eq!(err.to_string(), PR_CLOSED);
        assert!(h.scm.state().created_deployments.is_empty());
        assert!(h.store.list_deployments(h.env.id, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let h = harness(EnvironmentMode::Manual).await;
        h.created(7).await;

        let err = h.orchestrator.create(&h.env, create_request(7)).await.unwrap_err();
        assert!(matches!(err, PreviewError::Conflict(_)));
        assert_eq!(h.scm.state().created_deployments.len(), 1);
    }

    #[tokio::test]
    async fn protected_namespaces_are_rejected_on_create() {
        let h = harness(EnvironmentMode::Manual).await;
        h.scm.open_pull(7, "feat");
        let mut req = create_request(7);
        req.namespace = "kube-system".to_string();

        let err = h.orchestrator.create(&h.env, req).await.unwrap_err();
        assert!(matches!(err, PreviewError::BadRequest(_)));
    }

    #[tokio::test]
    async fn inactive_rows_are_revived_by_create() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        h.orchestrator
            .update_status(h.located(d.id).await, DeploymentStatus::Inactive)
            .await
            .unwrap();

        let revived = h.orchestrator.create(&h.env, create_request(7)).await.unwrap();
        assert_eq!(revived.id, d.id);
        assert_eq!(revived.status, DeploymentStatus::Creating);
        assert_ne!(revived.gh_deployment_id, d.gh_deployment_id);
    }

    #[tokio::test]
    async fn finalize_on_closed_pull_request_skips_the_comment() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        h.scm.close_pull(7);

        let finalized = h
            .orchestrator
            .finalize_success(h.located(d.id).await, "x.example.com")
            .await
            .unwrap();
        assert_eq!(finalized.status, DeploymentStatus::Created);
        assert_eq!(finalized.subdomain.as_deref(), Some("x.example.com"));

        let state = h.scm.state();
        let (id, status) = state.statuses.last().unwrap();
        assert_eq!(*id, d.gh_deployment_id);
        assert_eq!(status.state, DeploymentState::Success);
        assert_eq!(status.environment_url.as_deref(), Some("https://x.example.com"));
        assert!(state.comments.is_empty());
    }

    #[tokio::test]
    async fn failure_finalize_on_closed_pull_request_conflicts_after_persisting() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        h.scm.close_pull(7);

        let errors = BTreeMap::from([("web".to_string(), "crashed".to_string())]);
        let err = h
            .orchestrator
            .finalize_errors(h.located(d.id).await, &errors, &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), PR_CLOSED);

        let stored = h.store.read_deployment(h.env.id, "pr-7").await.unwrap();
        assert_eq!(stored.status, DeploymentStatus::Failed);
        assert_eq!(stored.last_errors, "web: crashed");
        assert_eq!(h.scm.state().statuses.last().unwrap().1.state, DeploymentState::Failure);
    }

    #[tokio::test]
    async fn refinalizing_edits_the_same_comment() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;

        let first = h
            .orchestrator
            .finalize_success(h.located(d.id).await, "x.example.com")
            .await
            .unwrap();
        assert_ne!(first.gh_pr_comment_id, 0);

        let second = h
            .orchestrator
            .finalize_success(h.located(d.id).await, "x.example.com")
            .await
            .unwrap();
        assert_eq!(second.gh_pr_comment_id, first.gh_pr_comment_id);

        let state = h.scm.state();
        assert_eq!(state.comments_created, 1);
        let (pr, body) = &state.comments[&first.gh_pr_comment_id];
        assert_eq!(*pr, 7);
        assert!(body.contains("Frontend preview URL: https://x.example.com"));
    }

    #[tokio::test]
    async fn failure_comment_links_the_latest_run() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        h.scm.push_run(55, "completed");

        let errors = BTreeMap::from([("worker".to_string(), "OOMKilled".to_string())]);
        let failed = h
            .orchestrator
            .finalize_errors(h.located(d.id).await, &errors, &["web".to_string()])
            .await
            .unwrap();

        let state = h.scm.state();
        let (_, body) = &state.comments[&failed.gh_pr_comment_id];
        assert!(body.contains("https://github.com/acme/web/actions/runs/55"));
        assert!(body.contains("<code>worker</code>"));
    }

    #[tokio::test]
    async fn disabled_comments_are_never_posted() {
        let h = harness(EnvironmentMode::Manual).await;
        let mut env = h.env.clone();
        env.new_comments_disabled = true;
        h.store.update_environment(&env).await.unwrap();
        let d = h.created(7).await;

        h.orchestrator
            .finalize_success(h.located(d.id).await, "x.example.com")
            .await
            .unwrap();
        assert!(h.scm.state().comments.is_empty());
    }

    #[tokio::test]
    async fn status_post_failure_is_reported_but_row_persists() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        h.scm.fail("create_deployment_status", 500);

        let err = h
            .orchestrator
            .finalize_success(h.located(d.id).await, "x.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::Upstream(_)));
        let stored = h.store.read_deployment(h.env.id, "pr-7").await.unwrap();
        assert_eq!(stored.status, DeploymentStatus::Created);
    }

    #[tokio::test]
    async fn empty_errors_are_rejected() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        let err = h
            .orchestrator
            .finalize_errors(h.located(d.id).await, &BTreeMap::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::BadRequest(_)));
    }

    #[tokio::test]
    async fn deleting_a_system_namespace_row_skips_the_namespace() {
        let h = harness(EnvironmentMode::Manual).await;
        let legacy = h
            .store
            .create_deployment(NewDeployment {
                environment_id: h.env.id,
                namespace: "kube-system".to_string(),
                status: DeploymentStatus::Created,
                pull_request_id: 3,
                pr_branch_from: "old".to_string(),
                gh_deployment_id: 55,
                github_metadata: GitHubMetadata::default(),
            })
            .await
            .unwrap();

        h.orchestrator.delete(h.located(legacy.id).await).await.unwrap();

        assert!(h.cluster.state().deleted.is_empty());
        assert!(h.store.read_deployment(h.env.id, "kube-system").await.is_err());
        let state = h.scm.state();
        assert_eq!(state.statuses.len(), 1);
        assert_eq!(state.statuses[0].0, 55);
        assert_eq!(state.statuses[0].1.state, DeploymentState::Inactive);
    }

    #[tokio::test]
    async fn delete_removes_namespace_then_row() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;

        h.orchestrator.delete(h.located(d.id).await).await.unwrap();
        assert_eq!(h.cluster.state().deleted, vec!["pr-7".to_string()]);
        assert!(h.store.read_deployment(h.env.id, "pr-7").await.is_err());
    }

    #[tokio::test]
    async fn namespace_failure_keeps_the_row() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        h.cluster.state().fail_deletes = true;

        let err = h.orchestrator.delete(h.located(d.id).await).await.unwrap_err();
        assert!(matches!(err, PreviewError::Upstream(_)));
        assert!(h.store.read_deployment(h.env.id, "pr-7").await.is_ok());
    }

    #[tokio::test]
    async fn running_workflow_blocks_trigger() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        let d = h
            .orchestrator
            .finalize_success(h.located(d.id).await, "")
            .await
            .unwrap();
        h.scm.push_run(1, "in_progress");

        let err = h
            .orchestrator
            .trigger_workflow(h.located(d.id).await)
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::Conflict(_)));
        assert!(h.scm.state().dispatches.is_empty());
        assert_eq!(h.store.read_deployment(h.env.id, "pr-7").await.unwrap(), d);
    }

    #[tokio::test]
    async fn trigger_reruns_the_latest_run() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        h.orchestrator
            .finalize_success(h.located(d.id).await, "")
            .await
            .unwrap();
        h.scm.push_run(8, "completed");

        let triggered = h.orchestrator.trigger_workflow(h.located(d.id).await).await.unwrap();
        assert_eq!(triggered.status, DeploymentStatus::Updating);
        assert_eq!(h.scm.state().reruns, vec![8]);
    }

    #[tokio::test]
    async fn forbidden_rerun_falls_back_to_dispatch() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        h.orchestrator
            .finalize_success(h.located(d.id).await, "")
            .await
            .unwrap();
        h.scm.push_run(8, "completed");
        h.scm.fail("rerun_workflow", 403);

        h.orchestrator.trigger_workflow(h.located(d.id).await).await.unwrap();
        let state = h.scm.state();
        assert_eq!(state.dispatches.len(), 1);
        assert_eq!(state.dispatches[0].git_ref, "feat");
        assert_eq!(state.dispatches[0].inputs.pr_number, "7");
        assert_eq!(state.dispatches[0].workflow_file, "porter_preview_env.yml");
    }

    #[tokio::test]
    async fn trigger_requires_created_or_failed() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        let err = h
            .orchestrator
            .trigger_workflow(h.located(d.id).await)
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::Conflict(_)));
    }

    #[tokio::test]
    async fn inactive_deployments_ignore_status_requests_other_than_creating() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        let inactive = h
            .orchestrator
            .update_status(h.located(d.id).await, DeploymentStatus::Inactive)
            .await
            .unwrap();

        for target in [
            DeploymentStatus::Created,
            DeploymentStatus::Updating,
            DeploymentStatus::Failed,
            DeploymentStatus::Inactive,
        ] {
            let unchanged = h
                .orchestrator
                .update_status(h.located(d.id).await, target)
                .await
                .unwrap();
            assert_eq!(unchanged, inactive);
        }

        let revived = h
            .orchestrator
            .update_status(h.located(d.id).await, DeploymentStatus::Creating)
            .await
            .unwrap();
        assert_eq!(revived.status, DeploymentStatus::Creating);
    }

    #[tokio::test]
    async fn stale_rows_are_reread_and_retried() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        let stale = h.located(d.id).await;

        let mut concurrent = d.clone();
        concurrent.subdomain = Some("other.example.com".to_string());
        h.store.update_deployment(&concurrent).await.unwrap();

        let finalized = h
            .orchestrator
            .finalize_success(stale, "x.example.com")
            .await
            .unwrap();
        assert_eq!(finalized.subdomain.as_deref(), Some("x.example.com"));
        assert_eq!(finalized.version, d.version + 3);
    }

    #[tokio::test]
    async fn rebuild_creates_a_new_github_deployment() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;

        let rebuilt = h
            .orchestrator
            .update(
                h.located(d.id).await,
                RebuildRequest {
                    action_id: 43,
                    commit_sha: "fedcba".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(rebuilt.status, DeploymentStatus::Updating);
        assert_ne!(rebuilt.gh_deployment_id, d.gh_deployment_id);
        assert_eq!(rebuilt.commit_sha(), "fedcba");
    }

    #[tokio::test]
    async fn reenable_dispatches_for_inactive_deployments_only() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;

        let err = h.orchestrator.reenable(h.located(d.id).await).await.unwrap_err();
        assert!(matches!(err, PreviewError::Conflict(_)));

        h.orchestrator.close_pull_request(&h.env, 7).await.unwrap();
        let located = h.located(d.id).await;

        let err = h.orchestrator.reenable(located.clone()).await.unwrap_err();
        assert!(matches!(err, PreviewError::FailedPrecondition(_)));
        assert!(h.scm.state().dispatches.is_empty());

        h.scm.state().files.insert(
            MANIFEST_PATH.to_string(),
            RepoFile {
                content: MANIFEST.as_bytes().to_vec(),
                sha: "m1".to_string(),
            },
        );
        let unchanged = h.orchestrator.reenable(located.clone()).await.unwrap();
        assert_eq!(unchanged, located.deployment);

        let state = h.scm.state();
        assert_eq!(state.dispatches.len(), 1);
        assert_eq!(state.dispatches[0].inputs.pr_branch_into, "main");
    }

    #[tokio::test]
    async fn closing_a_pull_request_tombstones_and_deletes_the_namespace() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;

        let closed = h.orchestrator.close_pull_request(&h.env, 7).await.unwrap().unwrap();
        assert_eq!(closed.status, DeploymentStatus::Inactive);
        assert_eq!(h.cluster.state().deleted, vec!["pr-7".to_string()]);
        assert_eq!(h.scm.state().statuses.last().unwrap().0, d.gh_deployment_id);

        assert!(h.orchestrator.close_pull_request(&h.env, 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_tombstones_closed_pull_requests() {
        let h = harness(EnvironmentMode::Manual).await;
        h.created(7).await;
        h.created(8).await;
        h.scm.close_pull(8);

        let listed = h.orchestrator.list(&h.env).await.unwrap();
        let status_of = |ns: &str| listed.iter().find(|d| d.namespace == ns).unwrap().status;
        assert_eq!(status_of("pr-7"), DeploymentStatus::Creating);
        assert_eq!(status_of("pr-8"), DeploymentStatus::Inactive);
    }

    #[tokio::test]
    async fn selectors_resolve_by_namespace_pr_number_or_branch() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;
        let key = h.env.key();

        let by_ns = DeploymentSelector {
            namespace: Some("pr-7".to_string()),
            ..Default::default()
        };
        assert_eq!(h.orchestrator.locate(&key, &by_ns).await.unwrap().deployment.id, d.id);

        let by_pr = DeploymentSelector {
            pr_number: Some(7),
            ..Default::default()
        };
        assert_eq!(h.orchestrator.locate(&key, &by_pr).await.unwrap().deployment.id, d.id);

        let branch_deploy = h
            .orchestrator
            .create(
                &h.env,
                CreateDeploymentRequest {
                    namespace: "release".to_string(),
                    pull_request_id: 0,
                    pr_branch_from: "release".to_string(),
                    action_id: 43,
                    github_metadata: GitHubMetadata::default(),
                },
            )
            .await
            .unwrap();
        let by_branch = DeploymentSelector {
            branch: Some("release".to_string()),
            ..Default::default()
        };
        assert_eq!(
            h.orchestrator.locate(&key, &by_branch).await.unwrap().deployment.id,
            branch_deploy.id
        );

        let by_cluster = h.orchestrator.locate_by_namespace(1, 1, "pr-7").await.unwrap();
        assert_eq!(by_cluster.deployment.id, d.id);
        assert_eq!(by_cluster.env.id, h.env.id);
        assert!(matches!(
            h.orchestrator.locate_by_namespace(1, 2, "pr-7").await.unwrap_err(),
            PreviewError::NotFound(_)
        ));

        let err = h
            .orchestrator
            .locate(&key, &DeploymentSelector::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::BadRequest(_)));
    }

    fn event(action: &str, number: i64) -> PullRequestEvent {
        PullRequestEvent {
            action: action.to_string(),
            number,
            title: "Add feature".to_string(),
            head_ref: "feat".to_string(),
            base_ref: "main".to_string(),
        }
    }

    #[tokio::test]
    async fn opened_pull_requests_dispatch_only_in_auto_mode() {
        let manual = harness(EnvironmentMode::Manual).await;
        assert!(matches!(
            manual.orchestrator.handle_pull_request(&manual.env, &event("opened", 7)).await.unwrap(),
            WebhookOutcome::Ignored(_)
        ));

        let auto = harness(EnvironmentMode::Auto).await;
        assert_eq!(
            auto.orchestrator.handle_pull_request(&auto.env, &event("opened", 7)).await.unwrap(),
            WebhookOutcome::Dispatched
        );
        let state = auto.scm.state();
        assert_eq!(state.dispatches[0].git_ref, "feat");
        assert_eq!(state.dispatches[0].inputs.pr_title, "Add feature");
    }

    #[tokio::test]
    async fn unwatched_base_branches_are_ignored() {
        let h = harness(EnvironmentMode::Auto).await;
        let mut env = h.env.clone();
        env.git_repo_branches = vec!["release".to_string()];

        assert!(matches!(
            h.orchestrator.handle_pull_request(&env, &event("opened", 7)).await.unwrap(),
            WebhookOutcome::Ignored(_)
        ));
    }

    #[tokio::test]
    async fn synchronize_redeploys_live_deployments_in_manual_mode() {
        let h = harness(EnvironmentMode::Manual).await;
        assert!(matches!(
            h.orchestrator.handle_pull_request(&h.env, &event("synchronize", 7)).await.unwrap(),
            WebhookOutcome::Ignored(_)
        ));

        h.created(7).await;
        assert_eq!(
            h.orchestrator.handle_pull_request(&h.env, &event("synchronize", 7)).await.unwrap(),
            WebhookOutcome::Dispatched
        );
    }

    #[tokio::test]
    async fn closed_event_tombstones() {
        let h = harness(EnvironmentMode::Manual).await;
        let d = h.created(7).await;

        assert_eq!(
            h.orchestrator.handle_pull_request(&h.env, &event("closed", 7)).await.unwrap(),
            WebhookOutcome::Closed
        );
        let stored = h.store.read_deployment(h.env.id, &d.namespace).await.unwrap();
        assert_eq!(stored.status, DeploymentStatus::Inactive);
    }

    #[test]
    fn environment_urls_default_to_https() {
        assert_eq!(environment_url("x.example.com"), "https://x.example.com");
        assert_eq!(environment_url("http://x.example.com"), "http://x.example.com");
    }
}
