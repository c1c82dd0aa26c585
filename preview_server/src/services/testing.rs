//! In-process fakes of the external gateways, recording every call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::cluster::{ensure_not_protected, ClusterConnector, ClusterError, ClusterGateway, ClusterResult};
use super::github::{
    DeploymentStatusUpdate, DispatchInputs, FileCommit, Hook, HookSpec, NewScmDeployment, PullRequest,
    PullRequestState, RepoFile, ScmError, ScmResult, SourceControl, WorkflowRun,
};
use crate::models::environment::{Environment, EnvironmentMode, NewEnvironment, RepoRef};
use crate::store::Store;

fn injected(operation: &str, code: u16) -> ScmError {
    let message = format!("{operation}: injected failure");
    match code {
        404 => ScmError::NotFound(message),
        409 => ScmError::Conflict(message),
        401 => ScmError::Unauthenticated(message),
        code => ScmError::Status { code, message },
    }
}

#[derive(Debug, Clone)]
pub struct Dispatch {
    pub workflow_file: String,
    pub git_ref: String,
    pub inputs: DispatchInputs,
}

#[derive(Debug, Default)]
pub struct ScmState {
    pub pulls: HashMap<i64, PullRequest>,
    pub hooks: Vec<Hook>,
    pub hook_secrets: HashMap<i64, String>,
    pub deleted_hooks: Vec<i64>,
    pub files: HashMap<String, RepoFile>,
    pub deleted_files: Vec<String>,
    pub default_branch: String,
    pub created_deployments: Vec<(i64, NewScmDeployment)>,
    pub deleted_deployments: Vec<i64>,
    pub statuses: Vec<(i64, DeploymentStatusUpdate)>,
    /// comment id -> (pr number, body)
    pub comments: BTreeMap<i64, (i64, String)>,
    pub comments_created: usize,
    pub runs: Vec<WorkflowRun>,
    pub dispatches: Vec<Dispatch>,
    pub reruns: Vec<i64>,
    /// Operation name -> HTTP status it fails with.
    pub failures: HashMap<&'static str, u16>,
    pub next_id: i64,
}

/// Source control double holding repository state in memory.
pub struct FakeScm {
    state: Mutex<ScmState>,
}

impl Default for FakeScm {
    fn default() -> Self {
        Self {
            state: Mutex::new(ScmState {
                default_branch: "main".to_string(),
                next_id: 100,
                ..Default::default()
            }),
        }
    }
}

impl FakeScm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, ScmState> {
        self.state.lock().unwrap()
    }

    pub fn open_pull(&self, number: i64, head_ref: &str) {
        self.set_pull(number, head_ref, PullRequestState::Open);
    }

    pub fn close_pull(&self, number: i64) {
        if let Some(pr) = self.state().pulls.get_mut(&number) {
            pr.state = PullRequestState::Closed;
        }
    }

    pub fn set_pull(&self, number: i64, head_ref: &str, state: PullRequestState) {
        self.state().pulls.insert(
            number,
            PullRequest {
                number,
                state,
                title: format!("PR {number}"),
                head_ref: head_ref.to_string(),
                head_sha: "0123456789abcdef".to_string(),
                base_ref: "main".to_string(),
            },
        );
    }

    pub fn fail(&self, operation: &'static str, code: u16) {
        self.state().failures.insert(operation, code);
    }

    pub fn push_run(&self, id: i64, status: &str) {
        self.state().runs.insert(
            0,
            WorkflowRun {
                id,
                status: status.to_string(),
                conclusion: None,
                html_url: format!("https://github.com/acme/web/actions/runs/{id}"),
            },
        );
    }

    fn check(&self, operation: &'static str) -> ScmResult<()> {
        match self.state().failures.get(operation) {
            Some(code) => Err(injected(operation, *code)),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> i64 {
        let mut state = self.state();
        state.next_id += 1;
        state.next_id
    }
}

#[async_trait]
impl SourceControl for FakeScm {
    async fn get_pull_request(&self, _repo: &RepoRef, number: i64) -> ScmResult<PullRequest> {
        self.check("get_pull_request")?;
        self.state()
            .pulls
            .get(&number)
            .cloned()
            .ok_or_else(|| ScmError::NotFound(format!("pull request {number}")))
    }

    async fn list_hooks(&self, _repo: &RepoRef) -> ScmResult<Vec<Hook>> {
        self.check("list_hooks")?;
        Ok(self.state().hooks.clone())
    }

    async fn create_hook(&self, _repo: &RepoRef, spec: &HookSpec) -> ScmResult<Hook> {
        self.check("create_hook")?;
        let hook = Hook {
            id: self.next_id(),
            url: spec.url.clone(),
            events: spec.events.clone(),
            active: spec.active,
        };
        let mut state = self.state();
        state.hooks.push(hook.clone());
        state.hook_secrets.insert(hook.id, spec.secret.clone());
        Ok(hook)
    }

    async fn delete_hook(&self, _repo: &RepoRef, hook_id: i64) -> ScmResult<()> {
        self.check("delete_hook")?;
        let mut state = self.state();
        let before = state.hooks.len();
        state.hooks.retain(|h| h.id != hook_id);
        if state.hooks.len() == before {
            return Err(ScmError::NotFound(format!("hook {hook_id}")));
        }
        state.deleted_hooks.push(hook_id);
        Ok(())
    }

    async fn get_contents(&self, _repo: &RepoRef, path: &str, _git_ref: Option<&str>) -> ScmResult<RepoFile> {
        self.check("get_contents")?;
        self.state()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ScmError::NotFound(format!("file {path}")))
    }

    async fn put_contents(&self, _repo: &RepoRef, commit: &FileCommit) -> ScmResult<()> {
        self.check("put_contents")?;
        let sha = format!("blob-{}", self.next_id());
        let mut state = self.state();
        if let Some(existing) = state.files.get(&commit.path) {
            if commit.sha.as_deref() != Some(existing.sha.as_str()) {
                return Err(ScmError::Conflict(format!("{} sha mismatch", commit.path)));
            }
        }
        state.files.insert(
            commit.path.clone(),
            RepoFile {
                content: commit.content.clone(),
                sha,
            },
        );
        Ok(())
    }

    async fn delete_contents(
        &self,
        _repo: &RepoRef,
        path: &str,
        _branch: &str,
        _message: &str,
        _sha: &str,
    ) -> ScmResult<()> {
        self.check("delete_contents")?;
        let mut state = self.state();
        if state.files.remove(path).is_none() {
            return Err(ScmError::NotFound(format!("file {path}")));
        }
        state.deleted_files.push(path.to_string());
        Ok(())
    }

    async fn get_default_branch(&self, _repo: &RepoRef) -> ScmResult<String> {
        self.check("get_default_branch")?;
        Ok(self.state().default_branch.clone())
    }

    async fn create_deployment(&self, _repo: &RepoRef, deployment: &NewScmDeployment) -> ScmResult<i64> {
        self.check("create_deployment")?;
        let id = self.next_id();
        self.state().created_deployments.push((id, deployment.clone()));
        Ok(id)
    }

    async fn create_deployment_status(
        &self,
        _repo: &RepoRef,
        deployment_id: i64,
        update: &DeploymentStatusUpdate,
    ) -> ScmResult<()> {
        self.check("create_deployment_status")?;
        self.state().statuses.push((deployment_id, update.clone()));
        Ok(())
    }

    async fn delete_deployment(&self, _repo: &RepoRef, deployment_id: i64) -> ScmResult<()> {
        self.check("delete_deployment")?;
        self.state().deleted_deployments.push(deployment_id);
        Ok(())
    }

    async fn upsert_pr_comment(
        &self,
        _repo: &RepoRef,
        pr_number: i64,
        comment_id: Option<i64>,
        body: &str,
    ) -> ScmResult<i64> {
        self.check("upsert_pr_comment")?;
        if let Some(id) = comment_id {
            if let Some(existing) = self.state().comments.get_mut(&id) {
                existing.1 = body.to_string();
                return Ok(id);
            }
        }
        let id = self.next_id();
        let mut state = self.state();
        state.comments.insert(id, (pr_number, body.to_string()));
        state.comments_created += 1;
        Ok(id)
    }

    async fn list_workflow_runs(
        &self,
        _repo: &RepoRef,
        _workflow_file: &str,
        _branch: &str,
        page: u32,
        per_page: u32,
    ) -> ScmResult<Vec<WorkflowRun>> {
        self.check("list_workflow_runs")?;
        let skip = (page.saturating_sub(1) * per_page) as usize;
        Ok(self
            .state()
            .runs
            .iter()
            .skip(skip)
            .take(per_page as usize)
            .cloned()
            .collect())
    }

    async fn dispatch_workflow(
        &self,
        _repo: &RepoRef,
        workflow_file: &str,
        git_ref: &str,
        inputs: &DispatchInputs,
    ) -> ScmResult<()> {
        self.check("dispatch_workflow")?;
        self.state().dispatches.push(Dispatch {
            workflow_file: workflow_file.to_string(),
            git_ref: git_ref.to_string(),
            inputs: inputs.clone(),
        });
        Ok(())
    }

    async fn rerun_workflow(&self, _repo: &RepoRef, run_id: i64) -> ScmResult<()> {
        self.check("rerun_workflow")?;
        self.state().reruns.push(run_id);
        Ok(())
    }

    async fn get_workflow_run_logs_url(&self, _repo: &RepoRef, run_id: i64) -> ScmResult<String> {
        self.check("get_workflow_run_logs_url")?;
        Ok(format!("https://logs.example.com/runs/{run_id}.zip"))
    }
}

#[derive(Debug, Default)]
pub struct ClusterState {
    pub namespaces: BTreeMap<String, BTreeMap<String, String>>,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub fail_deletes: bool,
}

/// Cluster double; every cluster id resolves to the same namespace set.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ClusterGateway for FakeCluster {
    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> ClusterResult<()> {
        ensure_not_protected(name)?;
        let mut state = self.state();
        state.namespaces.insert(name.to_string(), labels.clone());
        state.created.push(name.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        ensure_not_protected(name)?;
        let mut state = self.state();
        if state.fail_deletes {
            return Err(ClusterError::Api(format!("deleting namespace {name}: injected failure")));
        }
        state.namespaces.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }
}

pub struct FakeClusters(pub Arc<FakeCluster>);

#[async_trait]
impl ClusterConnector for FakeClusters {
    async fn connect(&self, _project_id: i64, _cluster_id: i64) -> ClusterResult<Arc<dyn ClusterGateway>> {
        Ok(self.0.clone())
    }
}

/// The environment most tests run against: project 1, cluster 1,
/// installation 9, repository `acme/web`.
pub fn new_environment(mode: EnvironmentMode) -> NewEnvironment {
    NewEnvironment {
        project_id: 1,
        cluster_id: 1,
        git_installation_id: 9,
        git_repo_owner: "acme".to_string(),
        git_repo_name: "web".to_string(),
        name: "preview".to_string(),
        mode,
        git_repo_branches: Vec::new(),
        git_deploy_branches: Vec::new(),
        new_comments_disabled: false,
        namespace_labels: BTreeMap::new(),
        webhook_uid: "uid-test".to_string(),
    }
}

pub async fn seed_environment(store: &dyn Store, mode: EnvironmentMode) -> Environment {
    store.create_environment(new_environment(mode)).await.unwrap()
}
