//! preview.deployment: One preview instance for a pull request or branch.

use std::fmt;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::preview_deployments;

/// Namespaces that are never used for, or deleted by, a preview deployment.
pub const PROTECTED_NAMESPACES: [&str; 9] = [
    "cert-manager",
    "ingress-nginx",
    "kube-node-lease",
    "kube-public",
    "kube-system",
    "monitoring",
    "porter-agent-system",
    "default",
    "ingress-nginx-private",
];

pub fn is_protected_namespace(namespace: &str) -> bool {
    PROTECTED_NAMESPACES.contains(&namespace)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Creating,
    Created,
    Updating,
    Failed,
    Inactive,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 5] = [
        Self::Creating,
        Self::Created,
        Self::Updating,
        Self::Failed,
        Self::Inactive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Updating => "updating",
            Self::Failed => "failed",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Transition table. `inactive` is terminal except for re-creation.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        matches!(
            (self, next),
            (Creating, Creating | Created | Updating | Failed | Inactive)
                | (Created, Creating | Created | Updating | Failed | Inactive)
                | (Updating, Creating | Created | Updating | Failed | Inactive)
                | (Failed, Creating | Created | Updating | Failed | Inactive)
                | (Inactive, Creating)
        )
    }

    /// States from which a workflow run may be triggered by a user.
    pub fn can_trigger_workflow(self) -> bool {
        matches!(self, Self::Created | Self::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pull request details captured at create/update time, so webhook paths
/// never have to re-query the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubMetadata {
    #[serde(default)]
    pub pr_name: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub pr_branch_into: String,
    #[serde(default)]
    pub repo_owner: String,
    #[serde(default)]
    pub repo_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deployment {
    pub id: i64,
    pub environment_id: i64,
    pub namespace: String,
    pub status: DeploymentStatus,
    pub subdomain: Option<String>,
    /// Zero for branch deployments.
    pub pull_request_id: i64,
    pub pr_branch_from: String,
    pub gh_deployment_id: i64,
    pub gh_pr_comment_id: i64,
    pub last_errors: String,
    pub github_metadata: GitHubMetadata,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn is_branch_deploy(&self) -> bool {
        self.pull_request_id == 0
    }

    pub fn commit_sha(&self) -> &str {
        &self.github_metadata.commit_sha
    }
}

/// Insert payload for a new deployment.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub environment_id: i64,
    pub namespace: String,
    pub status: DeploymentStatus,
    pub pull_request_id: i64,
    pub pr_branch_from: String,
    pub gh_deployment_id: i64,
    pub github_metadata: GitHubMetadata,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = preview_deployments)]
pub struct DeploymentRow {
    pub id: i64,
    pub environment_id: i64,
    pub namespace: String,
    pub status: String,
    pub subdomain: Option<String>,
    pub pull_request_id: i64,
    pub pr_branch_from: String,
    pub gh_deployment_id: i64,
    pub gh_pr_comment_id: i64,
    pub last_errors: String,
    pub pr_name: String,
    pub commit_sha: String,
    pub pr_branch_into: String,
    pub gh_repo_owner: String,
    pub gh_repo_name: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = preview_deployments)]
pub struct NewDeploymentRow {
    pub environment_id: i64,
    pub namespace: String,
    pub status: String,
    pub pull_request_id: i64,
    pub pr_branch_from: String,
    pub gh_deployment_id: i64,
    pub pr_name: String,
    pub commit_sha: String,
    pub pr_branch_into: String,
    pub gh_repo_owner: String,
    pub gh_repo_name: String,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = preview_deployments, treat_none_as_null = true)]
pub struct DeploymentChangeset {
    pub status: String,
    pub subdomain: Option<String>,
    pub pr_branch_from: String,
    pub gh_deployment_id: i64,
    pub gh_pr_comment_id: i64,
    pub last_errors: String,
    pub pr_name: String,
    pub commit_sha: String,
    pub pr_branch_into: String,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = String;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        let status = DeploymentStatus::parse(&row.status)
            .ok_or_else(|| format!("unknown deployment status '{}' on row {}", row.status, row.id))?;

        Ok(Self {
            id: row.id,
            environment_id: row.environment_id,
            namespace: row.namespace,
            status,
            subdomain: row.subdomain,
            pull_request_id: row.pull_request_id,
            pr_branch_from: row.pr_branch_from,
            gh_deployment_id: row.gh_deployment_id,
            gh_pr_comment_id: row.gh_pr_comment_id,
            last_errors: row.last_errors,
            github_metadata: GitHubMetadata {
                pr_name: row.pr_name,
                commit_sha: row.commit_sha,
                pr_branch_into: row.pr_branch_into,
                repo_owner: row.gh_repo_owner,
                repo_name: row.gh_repo_name,
            },
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<&NewDeployment> for NewDeploymentRow {
    fn from(d: &NewDeployment) -> Self {
        Self {
            environment_id: d.environment_id,
            namespace: d.namespace.clone(),
            status: d.status.as_str().to_string(),
            pull_request_id: d.pull_request_id,
            pr_branch_from: d.pr_branch_from.clone(),
            gh_deployment_id: d.gh_deployment_id,
            pr_name: d.github_metadata.pr_name.clone(),
            commit_sha: d.github_metadata.commit_sha.clone(),
            pr_branch_into: d.github_metadata.pr_branch_into.clone(),
            gh_repo_owner: d.github_metadata.repo_owner.clone(),
            gh_repo_name: d.github_metadata.repo_name.clone(),
        }
    }
}

impl DeploymentChangeset {
    /// Changeset for `d`, stamped with the next row version.
    pub fn next_version_of(d: &Deployment) -> Self {
        Self {
            status: d.status.as_str().to_string(),
            subdomain: d.subdomain.clone(),
            pr_branch_from: d.pr_branch_from.clone(),
            gh_deployment_id: d.gh_deployment_id,
            gh_pr_comment_id: d.gh_pr_comment_id,
            last_errors: d.last_errors.clone(),
            pr_name: d.github_metadata.pr_name.clone(),
            commit_sha: d.github_metadata.commit_sha.clone(),
            pr_branch_into: d.github_metadata.pr_branch_into.clone(),
            version: d.version + 1,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_only_accepts_creating() {
        for next in DeploymentStatus::ALL {
            assert_eq!(
                DeploymentStatus::Inactive.can_transition_to(next),
                next == DeploymentStatus::Creating,
                "inactive -> {next}"
            );
        }
    }

    #[test]
    fn live_states_can_be_tombstoned() {
        for from in [
            DeploymentStatus::Creating,
            DeploymentStatus::Created,
            DeploymentStatus::Updating,
            DeploymentStatus::Failed,
        ] {
            assert!(from.can_transition_to(DeploymentStatus::Inactive));
            assert!(from.can_transition_to(DeploymentStatus::Created));
            assert!(from.can_transition_to(DeploymentStatus::Failed));
        }
    }

    #[test]
    fn workflow_trigger_requires_settled_state() {
        assert!(DeploymentStatus::Created.can_trigger_workflow());
        assert!(DeploymentStatus::Failed.can_trigger_workflow());
        assert!(!DeploymentStatus::Creating.can_trigger_workflow());
        assert!(!DeploymentStatus::Updating.can_trigger_workflow());
        assert!(!DeploymentStatus::Inactive.can_trigger_workflow());
    }

    #[test]
    fn status_parses_its_own_strings() {
        for status in DeploymentStatus::ALL {
            assert_eq!(DeploymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeploymentStatus::parse("deleted"), None);
    }

    #[test]
    fn protected_namespaces_are_recognized() {
        assert!(is_protected_namespace("kube-system"));
        assert!(is_protected_namespace("default"));
        assert!(is_protected_namespace("ingress-nginx-private"));
        assert!(!is_protected_namespace("pr-7-repo"));
        assert!(!is_protected_namespace("kube-system-preview"));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&DeploymentStatus::Inactive).unwrap();
        assert_eq!(json, "\"inactive\"");
    }
}
