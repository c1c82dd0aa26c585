//! REST client for the GitHub API, authenticated per installation.
//!
//! 5xx responses are retried with capped exponential backoff. Network errors
//! are retried the same way only for methods that cannot create a second
//! remote object (POST is sent once). 4xx responses are returned immediately.
//! A 401 drops the cached installation token and retries once with a freshly
//! minted one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::installation::InstallationTokens;
use super::{
    DeploymentStatusUpdate, DispatchInputs, FileCommit, Hook, HookSpec, NewScmDeployment, PullRequest,
    PullRequestState, RepoFile, ScmError, ScmResult, SourceControl, WorkflowRun,
};
use crate::models::environment::RepoRef;

pub const USER_AGENT: &str = "preview-controller";

const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Delay before retry number `attempt` (1-based).
pub fn backoff(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((BACKOFF_BASE_MS * factor).min(BACKOFF_CAP_MS))
}

pub struct GitHubClient {
    http: reqwest::Client,
    http_no_redirect: reqwest::Client,
    api_url: String,
    tokens: Arc<InstallationTokens>,
    max_attempts: u32,
}

impl GitHubClient {
    pub fn new(
        api_url: &str,
        tokens: Arc<InstallationTokens>,
        timeout: Duration,
        max_attempts: u32,
    ) -> ScmResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScmError::Transport(e.to_string()))?;
        let http_no_redirect = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ScmError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            http_no_redirect,
            api_url: api_url.trim_end_matches('/').to_string(),
            tokens,
            max_attempts: max_attempts.clamp(1, 3),
        })
    }

    fn repo_url(&self, repo: &RepoRef, rest: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_url, repo.owner, repo.name, rest)
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        operation: &'static str,
        repo: &RepoRef,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> ScmResult<reqwest::Response> {
        let mut attempt = 0;
        let mut reminted = false;

        loop {
            attempt += 1;
            let token = self.tokens.token(repo.installation_id).await?;

            let mut req = client
                .request(method.clone(), url)
                .bearer_auth(&token)
                .header("Accept", "application/vnd.github+json")
                .header("User-Agent", USER_AGENT);
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status == StatusCode::UNAUTHORIZED && !reminted {
                        tracing::debug!(
                            installation_id = repo.installation_id,
                            operation,
                            "GitHub rejected installation token, re-minting"
                        );
                        self.tokens.invalidate(repo.installation_id);
                        reminted = true;
                        attempt -= 1;
                        continue;
                    }

                    if status.is_server_error() && attempt < self.max_attempts {
                        tracing::warn!(operation, attempt, %status, "GitHub server error, retrying");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }

                    if status.is_success() || status.is_redirection() {
                        crate::metrics::scm_request(operation, "ok");
                        return Ok(resp);
                    }

                    crate::metrics::scm_request(operation, "error");
                    return Err(error_from_response(operation, resp).await);
                }
                Err(e) if attempt < self.max_attempts && is_retryable(&e) && is_replayable(&method) => {
                    tracing::warn!(operation, attempt, "GitHub request failed, retrying: {e}");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => {
                    crate::metrics::scm_request(operation, "transport");
                    return Err(ScmError::Transport(format!("{operation}: {e}")));
                }
            }
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        repo: &RepoRef,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> ScmResult<T> {
        let resp = self.send(&self.http, operation, repo, method, url, body).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ScmError::Decode(format!("{operation}: {e}")))
    }
}

fn is_retryable(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

/// A POST that timed out may already have been committed by GitHub.
fn is_replayable(method: &Method) -> bool {
    *method != Method::POST
}

/// Append `pairs` to `url` as an encoded query string.
fn with_query(url: &str, pairs: &[(&str, &str)]) -> ScmResult<String> {
    let mut url = reqwest::Url::parse(url).map_err(|e| ScmError::Transport(format!("invalid url {url}: {e}")))?;
    url.query_pairs_mut().extend_pairs(pairs);
    Ok(url.into())
}

/// Map a non-success response onto the gateway's error kinds.
pub fn classify_status(operation: &str, status: StatusCode, message: String) -> ScmError {
    match status {
        StatusCode::NOT_FOUND => ScmError::NotFound(format!("{operation}: {message}")),
        StatusCode::CONFLICT => ScmError::Conflict(format!("{operation}: {message}")),
        StatusCode::UNAUTHORIZED => ScmError::Unauthenticated(format!("{operation}: {message}")),
        other => ScmError::Status {
            code: other.as_u16(),
            message: format!("{operation}: {message}"),
        },
    }
}

async fn error_from_response(operation: &str, resp: reqwest::Response) -> ScmError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or(text);
    classify_status(operation, status, message)
}

#[derive(Deserialize)]
struct PullRequestJson {
    number: i64,
    state: PullRequestState,
    #[serde(default)]
    title: String,
    head: BranchJson,
    base: BranchJson,
}

#[derive(Deserialize)]
struct BranchJson {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    sha: String,
}

#[derive(Deserialize)]
struct HookJson {
    id: i64,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    config: HookConfigJson,
}

#[derive(Deserialize, Default)]
struct HookConfigJson {
    #[serde(default)]
    url: String,
}

impl From<HookJson> for Hook {
    fn from(h: HookJson) -> Self {
        Hook {
            id: h.id,
            url: h.config.url,
            events: h.events,
            active: h.active,
        }
    }
}

#[derive(Deserialize)]
struct ContentsJson {
    #[serde(default)]
    content: String,
    sha: String,
}

#[derive(Deserialize)]
struct RepositoryJson {
    default_branch: String,
}

#[derive(Deserialize)]
struct IdJson {
    id: i64,
}

#[derive(Deserialize)]
struct WorkflowRunsJson {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

/// Decode the contents API's line-wrapped base64 payload.
pub fn decode_contents(encoded: &str) -> ScmResult<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|e| ScmError::Decode(format!("file contents: {e}")))
}

#[async_trait]
impl SourceControl for GitHubClient {
    async fn get_pull_request(&self, repo: &RepoRef, number: i64) -> ScmResult<PullRequest> {
        let url = self.repo_url(repo, &format!("/pulls/{number}"));
        let pr: PullRequestJson = self
            .send_json("get_pull_request", repo, Method::GET, &url, None)
            .await?;
        Ok(PullRequest {
            number: pr.number,
            state: pr.state,
            title: pr.title,
            head_ref: pr.head.git_ref,
            head_sha: pr.head.sha,
            base_ref: pr.base.git_ref,
        })
    }

    async fn list_hooks(&self, repo: &RepoRef) -> ScmResult<Vec<Hook>> {
        let url = self.repo_url(repo, "/hooks?per_page=100");
        let hooks: Vec<HookJson> = self.send_json("list_hooks", repo, Method::GET, &url, None).await?;
        Ok(hooks.into_iter().map(Hook::from).collect())
    }

    async fn create_hook(&self, repo: &RepoRef, spec: &HookSpec) -> ScmResult<Hook> {
        let url = self.repo_url(repo, "/hooks");
        let body = json!({
            "name": "web",
            "active": spec.active,
            "events": spec.events,
            "config": {
                "url": spec.url,
                "content_type": "json",
                "secret": spec.secret,
                "insecure_ssl": "0",
            },
        });
        let hook: HookJson = self
            .send_json("create_hook", repo, Method::POST, &url, Some(&body))
            .await?;
        Ok(hook.into())
    }

    async fn delete_hook(&self, repo: &RepoRef, hook_id: i64) -> ScmResult<()> {
        let url = self.repo_url(repo, &format!("/hooks/{hook_id}"));
        self.send(&self.http, "delete_hook", repo, Method::DELETE, &url, None)
            .await?;
        Ok(())
    }

    async fn get_contents(&self, repo: &RepoRef, path: &str, git_ref: Option<&str>) -> ScmResult<RepoFile> {
        let mut url = self.repo_url(repo, &format!("/contents/{path}"));
        if let Some(git_ref) = git_ref {
            url = with_query(&url, &[("ref", git_ref)])?;
        }
        let file: ContentsJson = self.send_json("get_contents", repo, Method::GET, &url, None).await?;
        Ok(RepoFile {
            content: decode_contents(&file.content)?,
            sha: file.sha,
        })
    }

    async fn put_contents(&self, repo: &RepoRef, commit: &FileCommit) -> ScmResult<()> {
        let url = self.repo_url(repo, &format!("/contents/{}", commit.path));
        let mut body = json!({
            "message": commit.message,
            "content": BASE64.encode(&commit.content),
            "branch": commit.branch,
        });
        if let Some(sha) = &commit.sha {
            body["sha"] = Value::String(sha.clone());
        }
        self.send(&self.http, "put_contents", repo, Method::PUT, &url, Some(&body))
            .await?;
        Ok(())
    }

    async fn delete_contents(
        &self,
        repo: &RepoRef,
        path: &str,
        branch: &str,
        message: &str,
        sha: &str,
    ) -> ScmResult<()> {
        let url = self.repo_url(repo, &format!("/contents/{path}"));
        let body = json!({ "message": message, "sha": sha, "branch": branch });
        self.send(&self.http, "delete_contents", repo, Method::DELETE, &url, Some(&body))
            .await?;
        Ok(())
    }

    async fn get_default_branch(&self, repo: &RepoRef) -> ScmResult<String> {
        let url = self.repo_url(repo, "");
        let repository: RepositoryJson = self
            .send_json("get_repository", repo, Method::GET, &url, None)
            .await?;
        Ok(repository.default_branch)
    }

    async fn create_deployment(&self, repo: &RepoRef, deployment: &NewScmDeployment) -> ScmResult<i64> {
        let url = self.repo_url(repo, "/deployments");
        let body = json!({
            "ref": deployment.git_ref,
            "environment": deployment.environment_name,
            "auto_merge": false,
            "required_contexts": [],
            "transient_environment": true,
            "payload": { "action_id": deployment.action_id },
        });
        let created: IdJson = self
            .send_json("create_deployment", repo, Method::POST, &url, Some(&body))
            .await?;
        Ok(created.id)
    }

    async fn create_deployment_status(
        &self,
        repo: &RepoRef,
        deployment_id: i64,
        update: &DeploymentStatusUpdate,
    ) -> ScmResult<()> {
        let url = self.repo_url(repo, &format!("/deployments/{deployment_id}/statuses"));
        let mut body = json!({ "state": update.state, "auto_inactive": false });
        if let Some(env_url) = &update.environment_url {
            body["environment_url"] = Value::String(env_url.clone());
        }
        if let Some(description) = &update.description {
            body["description"] = Value::String(description.clone());
        }
        self.send(
            &self.http,
            "create_deployment_status",
            repo,
            Method::POST,
            &url,
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_deployment(&self, repo: &RepoRef, deployment_id: i64) -> ScmResult<()> {
        let url = self.repo_url(repo, &format!("/deployments/{deployment_id}"));
        self.send(&self.http, "delete_deployment", repo, Method::DELETE, &url, None)
            .await?;
        Ok(())
    }

    async fn upsert_pr_comment(
        &self,
        repo: &RepoRef,
        pr_number: i64,
        comment_id: Option<i64>,
        body: &str,
    ) -> ScmResult<i64> {
        let payload = json!({ "body": body });

        if let Some(comment_id) = comment_id {
            let url = self.repo_url(repo, &format!("/issues/comments/{comment_id}"));
            match self
                .send_json::<IdJson>("edit_pr_comment", repo, Method::PATCH, &url, Some(&payload))
                .await
            {
                Ok(edited) => return Ok(edited.id),
                Err(ScmError::NotFound(_)) => {
                    tracing::info!(pr_number, comment_id, "Previous PR comment is gone, creating a new one");
                }
                Err(e) => return Err(e),
            }
        }

        let url = self.repo_url(repo, &format!("/issues/{pr_number}/comments"));
        let created: IdJson = self
            .send_json("create_pr_comment", repo, Method::POST, &url, Some(&payload))
            .await?;
        Ok(created.id)
    }

    async fn list_workflow_runs(
        &self,
        repo: &RepoRef,
        workflow_file: &str,
        branch: &str,
        page: u32,
        per_page: u32,
    ) -> ScmResult<Vec<WorkflowRun>> {
        let (page, per_page) = (page.to_string(), per_page.to_string());
        let url = with_query(
            &self.repo_url(repo, &format!("/actions/workflows/{workflow_file}/runs")),
            &[("branch", branch), ("page", page.as_str()), ("per_page", per_page.as_str())],
        )?;
        let runs: WorkflowRunsJson = self
            .send_json("list_workflow_runs", repo, Method::GET, &url, None)
            .await?;
        Ok(runs.workflow_runs)
    }

    async fn dispatch_workflow(
        &self,
        repo: &RepoRef,
        workflow_file: &str,
        git_ref: &str,
        inputs: &DispatchInputs,
    ) -> ScmResult<()> {
        let url = self.repo_url(repo, &format!("/actions/workflows/{workflow_file}/dispatches"));
        let body = json!({ "ref": git_ref, "inputs": inputs });
        self.send(&self.http, "dispatch_workflow", repo, Method::POST, &url, Some(&body))
            .await?;
        Ok(())
    }

    async fn rerun_workflow(&self, repo: &RepoRef, run_id: i64) -> ScmResult<()> {
        let url = self.repo_url(repo, &format!("/actions/runs/{run_id}/rerun"));
        self.send(&self.http, "rerun_workflow", repo, Method::POST, &url, None)
            .await?;
        Ok(())
    }

    async fn get_workflow_run_logs_url(&self, repo: &RepoRef, run_id: i64) -> ScmResult<String> {
        let url = self.repo_url(repo, &format!("/actions/runs/{run_id}/logs"));
        let resp = self
            .send(
                &self.http_no_redirect,
                "get_workflow_run_logs_url",
                repo,
                Method::GET,
                &url,
                None,
            )
            .await?;
        resp.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ScmError::Decode("workflow logs response had no Location header".to_string()))
    }
}
