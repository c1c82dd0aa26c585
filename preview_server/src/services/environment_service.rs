//! Binding repositories as preview environments: webhook, workflow file and
//! row are created together and torn down together.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::deployment_service::{DeploymentOrchestrator, Located};
use super::github::{FileCommit, HookSpec, ScmError, ScmResult, SourceControl};
use super::manifest;
use super::workflow::{self, WorkflowParams};
use crate::error::{PreviewError, PreviewResult};
use crate::models::environment::{normalize_branches, Environment, EnvironmentKey, EnvironmentMode, NewEnvironment, RepoRef};
use crate::store::{Store, StoreError};

/// Path of the incoming webhook endpoint, relative to the public base URL.
pub const WEBHOOK_PATH: &str = "/api/github/incoming_webhook";

const WEBHOOK_UID_LEN: usize = 32;

/// Server-wide values every bind needs.
#[derive(Debug, Clone)]
pub struct BindSettings {
    pub server_url: String,
    pub webhook_secret: String,
    pub token_signing_key: String,
}

impl BindSettings {
    fn webhook_prefix(&self) -> String {
        format!("{}{WEBHOOK_PATH}/", self.server_url.trim_end_matches('/'))
    }

    pub fn webhook_url(&self, webhook_uid: &str) -> String {
        format!("{}{webhook_uid}", self.webhook_prefix())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindRequest {
    pub name: String,
    #[serde(default)]
    pub mode: EnvironmentMode,
    #[serde(default)]
    pub git_repo_branches: Vec<String>,
    #[serde(default)]
    pub git_deploy_branches: Vec<String>,
    #[serde(default)]
    pub disable_new_comments: bool,
    #[serde(default)]
    pub namespace_labels: BTreeMap<String, String>,
}

/// Partial settings update. Absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsRequest {
    pub mode: Option<EnvironmentMode>,
    pub git_repo_branches: Option<Vec<String>>,
    pub git_deploy_branches: Option<Vec<String>>,
    pub disable_new_comments: Option<bool>,
    pub namespace_labels: Option<BTreeMap<String, String>>,
}

/// A freshly bound environment and the token CI authenticates with. The token
/// is only ever returned here.
#[derive(Debug, Clone, Serialize)]
pub struct BoundEnvironment {
    #[serde(flatten)]
    pub environment: Environment,
    pub service_token: String,
}

/// External side effects of a bind, undone if a later step fails.
#[derive(Debug, Default)]
struct BindProgress {
    hook_id: Option<i64>,
    workflow: Option<(String, String)>,
}

pub fn generate_webhook_uid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(WEBHOOK_UID_LEN)
        .map(char::from)
        .collect()
}

/// Delete `path` on `branch` (default branch when `None`). Missing files count as deleted.
async fn delete_file(scm: &dyn SourceControl, repo: &RepoRef, branch: Option<&str>, path: &str) -> ScmResult<()> {
    let branch = match branch {
        Some(b) => b.to_string(),
        None => scm.get_default_branch(repo).await?,
    };
    let file = match scm.get_contents(repo, path, Some(&branch)).await {
        Ok(file) => file,
        Err(ScmError::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    match scm
        .delete_contents(repo, path, &branch, "Remove preview environment workflow", &file.sha)
        .await
    {
        Ok(()) | Err(ScmError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

pub struct EnvironmentManager {
    store: Arc<dyn Store>,
    scm: Arc<dyn SourceControl>,
    deployments: Arc<DeploymentOrchestrator>,
    settings: BindSettings,
}

impl EnvironmentManager {
    pub fn new(
        store: Arc<dyn Store>,
        scm: Arc<dyn SourceControl>,
        deployments: Arc<DeploymentOrchestrator>,
        settings: BindSettings,
    ) -> Self {
        Self {
            store,
            scm,
            deployments,
            settings,
        }
    }

    pub fn settings(&self) -> &BindSettings {
        &self.settings
    }

    // ── Bind ──

    /// Bind the repository identified by `key`. On failure after the row is
    /// written, the hook, the workflow file and the row are removed again.
    pub async fn bind(&self, key: &EnvironmentKey, req: BindRequest, user_id: &str) -> PreviewResult<BoundEnvironment> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(PreviewError::BadRequest("environment name is required".to_string()));
        }

        let env = self
            .store
            .create_environment(NewEnvironment {
                project_id: key.project_id,
                cluster_id: key.cluster_id,
                git_installation_id: key.installation_id,
                git_repo_owner: key.owner.clone(),
                git_repo_name: key.name.clone(),
                name,
                mode: req.mode,
                git_repo_branches: normalize_branches(&req.git_repo_branches),
                git_deploy_branches: normalize_branches(&req.git_deploy_branches),
                new_comments_disabled: req.disable_new_comments,
                namespace_labels: req.namespace_labels,
                webhook_uid: generate_webhook_uid(),
            })
            .await?;

        let mut progress = BindProgress::default();
        match self.bind_external(env.clone(), user_id, &mut progress).await {
            Ok(bound) => {
                tracing::info!(
                    environment_id = bound.environment.id,
                    repo = %bound.environment.repo().full_name(),
                    hook_id = bound.environment.github_webhook_id,
                    "Environment bound"
                );
                Ok(bound)
            }
            Err(e) => {
                tracing::error!(environment_id = env.id, "Bind failed, rolling back: {e}");
                self.compensate_bind(&env, progress).await;
                Err(e)
            }
        }
    }

    async fn bind_external(
        &self,
        mut env: Environment,
        user_id: &str,
        progress: &mut BindProgress,
    ) -> PreviewResult<BoundEnvironment> {
        let repo = env.repo();

        self.remove_stale_hooks(&env).await?;

        let hook = self
            .scm
            .create_hook(
                &repo,
                &HookSpec {
                    url: self.settings.webhook_url(&env.webhook_uid),
                    events: vec!["pull_request".to_string()],
                    secret: self.settings.webhook_secret.clone(),
                    active: false,
                },
            )
            .await?;
        progress.hook_id = Some(hook.id);

        let service_token =
            workflow::mint_service_token(&self.settings.token_signing_key, user_id, env.project_id, env.cluster_id)
                .map_err(|e| PreviewError::Internal(format!("minting service token: {e}")))?;

        let contents = workflow::render_workflow(&WorkflowParams {
            server_url: &self.settings.server_url,
            project_id: env.project_id,
            cluster_id: env.cluster_id,
            installation_id: env.git_installation_id,
            repo_owner: &env.git_repo_owner,
            repo_name: &env.git_repo_name,
            env_name: &env.name,
        })
        .map_err(|e| PreviewError::Internal(format!("rendering workflow: {e}")))?;

        let branch = self.scm.get_default_branch(&repo).await?;
        let path = workflow::workflow_path(&env.workflow_file_name());
        let existing_sha = match self.scm.get_contents(&repo, &path, Some(&branch)).await {
            Ok(file) => Some(file.sha),
            Err(ScmError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        self.scm
            .put_contents(
                &repo,
                &FileCommit {
                    path: path.clone(),
                    branch: branch.clone(),
                    message: format!("Add preview environment workflow for {}", env.name),
                    content: contents.into_bytes(),
                    sha: existing_sha,
                },
            )
            .await?;
        progress.workflow = Some((branch, path));

        env.github_webhook_id = hook.id;
        let environment = self.store.update_environment(&env).await?;

        Ok(BoundEnvironment {
            environment,
            service_token,
        })
    }

    /// Drop hooks pointing at this service unless another environment owns them.
    async fn remove_stale_hooks(&self, env: &Environment) -> PreviewResult<()> {
        let repo = env.repo();
        let prefix = self.settings.webhook_prefix();

        for hook in self.scm.list_hooks(&repo).await? {
            let Some(uid) = hook.url.strip_prefix(&prefix) else {
                continue;
            };
            if uid != env.webhook_uid {
                // Only hooks with no owning environment are stale.
                match self
                    .store
                    .read_environment_by_webhook_id(uid, &env.git_repo_owner, &env.git_repo_name)
                    .await
                {
                    Ok(owner) if owner.id != env.id => continue,
                    Ok(_) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            match self.scm.delete_hook(&repo, hook.id).await {
                Ok(()) | Err(ScmError::NotFound(_)) => {
                    tracing::info!(environment_id = env.id, hook_id = hook.id, "Removed stale webhook")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Runs on its own task so the rollback finishes even if the caller goes away.
    async fn compensate_bind(&self, env: &Environment, progress: BindProgress) {
        crate::metrics::compensation("bind");
        let scm = self.scm.clone();
        let store = self.store.clone();
        let repo = env.repo();
        let env_id = env.id;

        let task = tokio::spawn(async move {
            if let Some((branch, path)) = progress.workflow {
                if let Err(e) = delete_file(scm.as_ref(), &repo, Some(&branch), &path).await {
                    tracing::warn!(environment_id = env_id, path = %path, "Could not roll back workflow file: {e}");
                }
            }
            if let Some(hook_id) = progress.hook_id {
                match scm.delete_hook(&repo, hook_id).await {
                    Ok(()) | Err(ScmError::NotFound(_)) => {}
                    Err(e) => tracing::warn!(environment_id = env_id, hook_id, "Could not roll back webhook: {e}"),
                }
            }
            if let Err(e) = store.delete_environment(env_id).await {
                tracing::warn!(environment_id = env_id, "Could not roll back environment row: {e}");
            }
        });
        if let Err(e) = task.await {
            tracing::warn!(environment_id = env.id, "Bind compensation aborted: {e}");
        }
    }

    // ── Unbind ──

    /// Remove the workflow file, the hook and every deployment, then the row.
    /// The row stays if any external cleanup fails.
    pub async fn unbind(&self, key: &EnvironmentKey) -> PreviewResult<()> {
        let env = self.store.read_environment(key).await?;
        let repo = env.repo();

        let path = workflow::workflow_path(&env.workflow_file_name());
        match delete_file(self.scm.as_ref(), &repo, None, &path).await {
            Ok(()) => {}
            Err(ScmError::NotFound(_)) => {
                tracing::info!(environment_id = env.id, "Repository gone, skipping workflow removal")
            }
            Err(e) => return Err(e.into()),
        }

        if env.github_webhook_id != 0 {
            match self.scm.delete_hook(&repo, env.github_webhook_id).await {
                Ok(()) | Err(ScmError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        for deployment in self.store.list_deployments(env.id, &[]).await? {
            self.deployments
                .delete(Located {
                    env: env.clone(),
                    deployment,
                })
                .await?;
        }

        self.store.delete_environment(env.id).await?;
        tracing::info!(environment_id = env.id, repo = %repo.full_name(), "Environment unbound");
        Ok(())
    }

    // ── Settings ──

    /// Writes the row only when something changed. New labels are re-applied
    /// to live namespaces.
    pub async fn update_settings(&self, env: Environment, req: SettingsRequest) -> PreviewResult<Environment> {
        let mut next = env.clone();
        if let Some(mode) = req.mode {
            next.mode = mode;
        }
        if let Some(branches) = &req.git_repo_branches {
            next.git_repo_branches = normalize_branches(branches);
        }
        if let Some(branches) = &req.git_deploy_branches {
            next.git_deploy_branches = normalize_branches(branches);
        }
        if let Some(disabled) = req.disable_new_comments {
            next.new_comments_disabled = disabled;
        }
        if let Some(labels) = req.namespace_labels {
            next.namespace_labels = labels;
        }

        if next == env {
            return Ok(env);
        }

        let updated = self.store.update_environment(&next).await?;
        tracing::info!(environment_id = updated.id, "Environment settings updated");

        if updated.namespace_labels != env.namespace_labels {
            if let Err(e) = self.deployments.relabel_namespaces(&updated).await {
                tracing::warn!(environment_id = updated.id, "Could not relabel namespaces: {e}");
            }
        }
        Ok(updated)
    }

    pub async fn toggle_new_comment(&self, env: Environment, disable: bool) -> PreviewResult<Environment> {
        self.update_settings(
            env,
            SettingsRequest {
                disable_new_comments: Some(disable),
                ..Default::default()
            },
        )
        .await
    }

    // ── Reads ──

    pub async fn get(&self, key: &EnvironmentKey) -> PreviewResult<Environment> {
        Ok(self.store.read_environment(key).await?)
    }

    pub async fn get_by_id(&self, project_id: i64, cluster_id: i64, id: i64) -> PreviewResult<Environment> {
        Ok(self.store.read_environment_by_id(project_id, cluster_id, id).await?)
    }

    /// Lookup without the installation id, for callers that only know the repository.
    pub async fn get_by_repo(&self, project_id: i64, cluster_id: i64, owner: &str, name: &str) -> PreviewResult<Environment> {
        Ok(self
            .store
            .read_environment_by_owner_repo_name(project_id, cluster_id, owner, name)
            .await?)
    }

    pub async fn list(&self, project_id: i64, cluster_id: i64) -> PreviewResult<Vec<Environment>> {
        Ok(self.store.list_environments(project_id, cluster_id).await?)
    }

    /// Manifest defects on `branch`, or on the default branch when absent.
    pub async fn validate_manifest(&self, env: &Environment, branch: Option<&str>) -> PreviewResult<Vec<String>> {
        let branch = branch.filter(|b| !b.trim().is_empty());
        let defects = manifest::validate_branch(self.scm.as_ref(), &env.repo(), branch).await?;
        Ok(defects.iter().map(ToString::to_string).collect())
    }
}
