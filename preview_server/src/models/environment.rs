//! preview.environment: A repository bound to a (project, cluster, installation).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::preview_environments;

/// How pull requests on the repository spawn deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentMode {
    /// Deployments are only created when a user triggers the workflow.
    #[default]
    Manual,
    /// Opening a pull request dispatches the workflow automatically.
    Auto,
}

impl EnvironmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// A repository on the source-control provider, addressed through one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub installation_id: i64,
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(installation_id: i64, owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            installation_id,
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Unique identity of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentKey {
    pub project_id: i64,
    pub cluster_id: i64,
    pub installation_id: i64,
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Environment {
    pub id: i64,
    pub project_id: i64,
    pub cluster_id: i64,
    pub git_installation_id: i64,
    pub git_repo_owner: String,
    pub git_repo_name: String,
    pub name: String,
    pub mode: EnvironmentMode,
    /// Base branches whose pull requests are watched. Empty watches all.
    pub git_repo_branches: Vec<String>,
    /// Branches deployed directly, without a pull request.
    pub git_deploy_branches: Vec<String>,
    pub new_comments_disabled: bool,
    pub namespace_labels: BTreeMap<String, String>,
    #[serde(skip)]
    pub webhook_uid: String,
    pub github_webhook_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    pub fn key(&self) -> EnvironmentKey {
        EnvironmentKey {
            project_id: self.project_id,
            cluster_id: self.cluster_id,
            installation_id: self.git_installation_id,
            owner: self.git_repo_owner.clone(),
            name: self.git_repo_name.clone(),
        }
    }

    pub fn repo(&self) -> RepoRef {
        RepoRef::new(
            self.git_installation_id,
            self.git_repo_owner.clone(),
            self.git_repo_name.clone(),
        )
    }

    /// Whether pull requests into `base_branch` are previewed.
    pub fn watches_branch(&self, base_branch: &str) -> bool {
        self.git_repo_branches.is_empty() || self.git_repo_branches.iter().any(|b| b == base_branch)
    }

    /// File name of the workflow committed under `.github/workflows/`.
    pub fn workflow_file_name(&self) -> String {
        workflow_file_name(&self.name)
    }
}

/// `porter_<env-name>_env.yml`, with the name lowercased and separators folded to `_`.
pub fn workflow_file_name(env_name: &str) -> String {
    let normalized: String = env_name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect();
    format!("porter_{normalized}_env.yml")
}

/// Trim entries and drop blanks and duplicates, keeping first-seen order.
pub fn normalize_branches(branches: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(branches.len());
    for branch in branches {
        let branch = branch.trim();
        if !branch.is_empty() && !out.iter().any(|b| b == branch) {
            out.push(branch.to_string());
        }
    }
    out
}

/// Insert payload for a new environment.
#[derive(Debug, Clone)]
pub struct NewEnvironment {
    pub project_id: i64,
    pub cluster_id: i64,
    pub git_installation_id: i64,
    pub git_repo_owner: String,
    pub git_repo_name: String,
    pub name: String,
    pub mode: EnvironmentMode,
    pub git_repo_branches: Vec<String>,
    pub git_deploy_branches: Vec<String>,
    pub new_comments_disabled: bool,
    pub namespace_labels: BTreeMap<String, String>,
    pub webhook_uid: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = preview_environments)]
pub struct EnvironmentRow {
    pub id: i64,
    pub project_id: i64,
    pub cluster_id: i64,
    pub git_installation_id: i64,
    pub git_repo_owner: String,
    pub git_repo_name: String,
    pub name: String,
    pub mode: String,
    pub git_repo_branches: Vec<String>,
    pub git_deploy_branches: Vec<String>,
    pub new_comments_disabled: bool,
    pub namespace_labels: serde_json::Value,
    pub webhook_uid: String,
    pub github_webhook_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = preview_environments)]
pub struct NewEnvironmentRow {
    pub project_id: i64,
    pub cluster_id: i64,
    pub git_installation_id: i64,
    pub git_repo_owner: String,
    pub git_repo_name: String,
    pub name: String,
    pub mode: String,
    pub git_repo_branches: Vec<String>,
    pub git_deploy_branches: Vec<String>,
    pub new_comments_disabled: bool,
    pub namespace_labels: serde_json::Value,
    pub webhook_uid: String,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = preview_environments)]
pub struct EnvironmentChangeset {
    pub name: String,
    pub mode: String,
    pub git_repo_branches: Vec<String>,
    pub git_deploy_branches: Vec<String>,
    pub new_comments_disabled: bool,
    pub namespace_labels: serde_json::Value,
    pub github_webhook_id: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<EnvironmentRow> for Environment {
    fn from(row: EnvironmentRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            cluster_id: row.cluster_id,
            git_installation_id: row.git_installation_id,
            git_repo_owner: row.git_repo_owner,
            git_repo_name: row.git_repo_name,
            name: row.name,
            mode: EnvironmentMode::parse(&row.mode).unwrap_or_default(),
            git_repo_branches: row.git_repo_branches,
            git_deploy_branches: row.git_deploy_branches,
            new_comments_disabled: row.new_comments_disabled,
            namespace_labels: serde_json::from_value(row.namespace_labels).unwrap_or_default(),
            webhook_uid: row.webhook_uid,
            github_webhook_id: row.github_webhook_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl From<&NewEnvironment> for NewEnvironmentRow {
    fn from(env: &NewEnvironment) -> Self {
        Self {
            project_id: env.project_id,
            cluster_id: env.cluster_id,
            git_installation_id: env.git_installation_id,
            git_repo_owner: env.git_repo_owner.clone(),
            git_repo_name: env.git_repo_name.clone(),
            name: env.name.clone(),
            mode: env.mode.as_str().to_string(),
            git_repo_branches: env.git_repo_branches.clone(),
            git_deploy_branches: env.git_deploy_branches.clone(),
            new_comments_disabled: env.new_comments_disabled,
            namespace_labels: labels_to_json(&env.namespace_labels),
            webhook_uid: env.webhook_uid.clone(),
        }
    }
}

impl From<&Environment> for EnvironmentChangeset {
    fn from(env: &Environment) -> Self {
        Self {
            name: env.name.clone(),
            mode: env.mode.as_str().to_string(),
            git_repo_branches: env.git_repo_branches.clone(),
            git_deploy_branches: env.git_deploy_branches.clone(),
            new_comments_disabled: env.new_comments_disabled,
            namespace_labels: labels_to_json(&env.namespace_labels),
            github_webhook_id: env.github_webhook_id,
            updated_at: Utc::now(),
        }
    }
}

fn labels_to_json(labels: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}
