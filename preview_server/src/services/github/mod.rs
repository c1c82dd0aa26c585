//! GitHub integration: a typed gateway over the REST API, installation
//! tokens and webhook signature validation.

pub mod client;
pub mod installation;
pub mod signature;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::environment::RepoRef;

#[derive(Debug, thiserror::Error)]
pub enum ScmError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("GitHub credentials unavailable: {0}")]
    Unauthenticated(String),
    #[error("GitHub returned {code}: {message}")]
    Status { code: u16, message: String },
    #[error("GitHub request failed: {0}")]
    Transport(String),
    #[error("unexpected GitHub response: {0}")]
    Decode(String),
}

impl ScmError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::Conflict(_) => Some(409),
            Self::Unauthenticated(_) => Some(401),
            Self::Status { code, .. } => Some(*code),
            Self::Transport(_) | Self::Decode(_) => None,
        }
    }
}

pub type ScmResult<T> = Result<T, ScmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: i64,
    pub state: PullRequestState,
    pub title: String,
    pub head_ref: String,
    pub head_sha: String,
    pub base_ref: String,
}

impl PullRequest {
    pub fn is_open(&self) -> bool {
        self.state == PullRequestState::Open
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub id: i64,
    pub url: String,
    pub events: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct HookSpec {
    pub url: String,
    pub events: Vec<String>,
    pub secret: String,
    pub active: bool,
}

/// A file read through the contents API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    pub content: Vec<u8>,
    /// Blob sha, required to replace or delete the file.
    pub sha: String,
}

#[derive(Debug, Clone)]
pub struct FileCommit {
    pub path: String,
    pub branch: String,
    pub message: String,
    pub content: Vec<u8>,
    /// Blob sha of the file being replaced, if any.
    pub sha: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewScmDeployment {
    pub git_ref: String,
    pub action_id: i64,
    pub environment_name: String,
}

/// State of a deployment status posted to GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Success,
    Failure,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatusUpdate {
    pub state: DeploymentState,
    pub environment_url: Option<String>,
    pub description: Option<String>,
}

impl DeploymentStatusUpdate {
    pub fn new(state: DeploymentState) -> Self {
        Self {
            state,
            environment_url: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    /// `queued`, `in_progress`, `completed`, ...
    pub status: String,
    pub conclusion: Option<String>,
    pub html_url: String,
}

impl WorkflowRun {
    pub fn is_running(&self) -> bool {
        matches!(self.status.as_str(), "in_progress" | "queued")
    }
}

/// Inputs of the preview workflow's `workflow_dispatch` trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchInputs {
    pub pr_number: String,
    pub pr_title: String,
    pub pr_branch_from: String,
    pub pr_branch_into: String,
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn get_pull_request(&self, repo: &RepoRef, number: i64) -> ScmResult<PullRequest>;

    async fn list_hooks(&self, repo: &RepoRef) -> ScmResult<Vec<Hook>>;

    async fn create_hook(&self, repo: &RepoRef, spec: &HookSpec) -> ScmResult<Hook>;

    async fn delete_hook(&self, repo: &RepoRef, hook_id: i64) -> ScmResult<()>;

    /// `git_ref` of `None` reads the default branch.
    async fn get_contents(&self, repo: &RepoRef, path: &str, git_ref: Option<&str>) -> ScmResult<RepoFile>;

    async fn put_contents(&self, repo: &RepoRef, commit: &FileCommit) -> ScmResult<()>;

    async fn delete_contents(
        &self,
        repo: &RepoRef,
        path: &str,
        branch: &str,
        message: &str,
        sha: &str,
    ) -> ScmResult<()>;

    async fn get_default_branch(&self, repo: &RepoRef) -> ScmResult<String>;

    /// Returns the id of the new deployment object.
    async fn create_deployment(&self, repo: &RepoRef, deployment: &NewScmDeployment) -> ScmResult<i64>;

    async fn create_deployment_status(
        &self,
        repo: &RepoRef,
        deployment_id: i64,
        update: &DeploymentStatusUpdate,
    ) -> ScmResult<()>;

    async fn delete_deployment(&self, repo: &RepoRef, deployment_id: i64) -> ScmResult<()>;

    /// Edits `comment_id` when given and still present, otherwise creates a
    /// new comment. Returns the id of the comment that now holds `body`.
    async fn upsert_pr_comment(
        &self,
        repo: &RepoRef,
        pr_number: i64,
        comment_id: Option<i64>,
        body: &str,
    ) -> ScmResult<i64>;

    /// `NotFound` when the workflow file does not exist.
    async fn list_workflow_runs(
        &self,
        repo: &RepoRef,
        workflow_file: &str,
        branch: &str,
        page: u32,
        per_page: u32,
    ) -> ScmResult<Vec<WorkflowRun>>;

    async fn dispatch_workflow(
        &self,
        repo: &RepoRef,
        workflow_file: &str,
        git_ref: &str,
        inputs: &DispatchInputs,
    ) -> ScmResult<()>;

    async fn rerun_workflow(&self, repo: &RepoRef, run_id: i64) -> ScmResult<()>;

    async fn get_workflow_run_logs_url(&self, repo: &RepoRef, run_id: i64) -> ScmResult<String>;
}

/// Most recent run of `workflow_file` on `branch`, if any.
pub async fn latest_workflow_run(
    scm: &dyn SourceControl,
    repo: &RepoRef,
    workflow_file: &str,
    branch: &str,
) -> ScmResult<Option<WorkflowRun>> {
    let runs = scm.list_workflow_runs(repo, workflow_file, branch, 1, 1).await?;
    Ok(runs.into_iter().next())
}
