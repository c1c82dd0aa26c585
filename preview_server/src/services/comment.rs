//! The single pull-request comment kept per deployment.

use std::collections::BTreeMap;

use super::github::{ScmResult, SourceControl};
use crate::models::deployment::Deployment;
use crate::models::environment::Environment;

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

fn commit_link(owner: &str, name: &str, sha: &str) -> String {
    format!(
        "[`{}`](https://github.com/{owner}/{name}/commit/{sha})",
        short_sha(sha)
    )
}

/// Body posted after a successful deployment.
pub fn render_success(owner: &str, name: &str, sha: &str, subdomain: Option<&str>) -> String {
    let mut body = format!(
        "✅ The latest SHA ({}) has been successfully deployed.",
        commit_link(owner, name, sha)
    );
    if let Some(url) = subdomain.filter(|s| !s.is_empty()) {
        body.push_str(&format!("\nFrontend preview URL: {url}"));
    }
    body
}

/// Body posted after a failed deployment. `errors` maps resource name to message.
pub fn render_failure(
    owner: &str,
    name: &str,
    sha: &str,
    logs_url: Option<&str>,
    errors: &BTreeMap<String, String>,
    successful: &[String],
) -> String {
    let logs = match logs_url {
        Some(url) => format!("[View build logs]({url})"),
        None => "Build logs unavailable".to_string(),
    };

    let mut body = String::from("## ❌ Preview deployment failed\n\n");
    body.push_str("| Commit SHA | Build logs |\n|---|---|\n");
    body.push_str(&format!("| {} | {logs} |\n", commit_link(owner, name, sha)));

    if !successful.is_empty() {
        body.push_str("\n#### Successfully deployed resources\n");
        for resource in successful {
            body.push_str(&format!("- `{resource}`\n"));
        }
    }

    body.push_str("\n#### Failed resources\n");
    for (resource, message) in errors {
        let fence = fence_for(message);
        body.push_str(&format!(
            "<details>\n  <summary><code>{resource}</code></summary>\n\n{fence}\n{message}\n{fence}\n</details>\n"
        ));
    }

    body
}

/// A code fence longer than any backtick run inside `text`.
fn fence_for(text: &str) -> String {
    let longest_run = text
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    "`".repeat(longest_run.max(2) + 1)
}

/// Whether the deployment gets a comment at all.
pub fn comments_enabled(env: &Environment, deployment: &Deployment) -> bool {
    !deployment.is_branch_deploy() && !env.new_comments_disabled
}

/// Edits the deployment's existing comment or creates the first one.
pub struct CommentComposer<'a> {
    scm: &'a dyn SourceControl,
}

impl<'a> CommentComposer<'a> {
    pub fn new(scm: &'a dyn SourceControl) -> Self {
        Self { scm }
    }

    /// Returns the id of the comment now holding `body`.
    pub async fn upsert(&self, env: &Environment, deployment: &Deployment, body: &str) -> ScmResult<i64> {
        let existing = (deployment.gh_pr_comment_id != 0).then_some(deployment.gh_pr_comment_id);
        let id = self
            .scm
            .upsert_pr_comment(&env.repo(), deployment.pull_request_id, existing, body)
            .await?;
        tracing::debug!(
            deployment_id = deployment.id,
            pr_number = deployment.pull_request_id,
            comment_id = id,
            edited = existing == Some(id),
            "Upserted PR comment"
        );
        Ok(id)
    }
}
