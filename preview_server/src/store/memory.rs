//! In-process store backend for local development and tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::deployment::{Deployment, DeploymentStatus, NewDeployment};
use crate::models::environment::{Environment, EnvironmentKey, NewEnvironment};
use crate::models::revision::DeploymentRevision;
use crate::store::{Store, StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    environments: Vec<Environment>,
    deployments: Vec<Deployment>,
    revisions: Vec<DeploymentRevision>,
    next_environment_id: i64,
    next_deployment_id: i64,
    #[cfg(test)]
    fail_next_deployment_insert: bool,
    #[cfg(test)]
    fail_next_webhook_lookup: bool,
}

impl Tables {
    fn environment_in_scope(&self, id: i64, project_id: i64, cluster_id: i64) -> bool {
        self.environments
            .iter()
            .any(|e| e.id == id && e.project_id == project_id && e.cluster_id == cluster_id)
    }

    #[cfg(test)]
    fn take_injected_insert_failure(&mut self) -> bool {
        std::mem::take(&mut self.fail_next_deployment_insert)
    }

    #[cfg(not(test))]
    fn take_injected_insert_failure(&mut self) -> bool {
        false
    }

    #[cfg(test)]
    fn take_injected_lookup_failure(&mut self) -> bool {
        std::mem::take(&mut self.fail_next_webhook_lookup)
    }

    #[cfg(not(test))]
    fn take_injected_lookup_failure(&mut self) -> bool {
        false
    }

    fn append_revision(&mut self, deployment: &Deployment) {
        let revision = self
            .revisions
            .iter()
            .filter(|r| r.deployment_id == deployment.id)
            .map(|r| r.revision)
            .max()
            .unwrap_or(0)
            + 1;
        self.revisions.push(DeploymentRevision {
            deployment_id: deployment.id,
            revision,
            status: deployment.status,
            commit_sha: deployment.commit_sha().to_string(),
            created_at: Utc::now(),
        });
    }
}

/// `Store` backed by vectors behind a mutex. Honors the same uniqueness,
/// versioning and revision rules as the PostgreSQL backend.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> StoreResult<T>) -> StoreResult<T> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        f(&mut tables)
    }

    /// Make the next deployment insert fail as a uniqueness race would.
    #[cfg(test)]
    pub fn fail_next_deployment_insert(&self) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.fail_next_deployment_insert = true;
        }
    }

    /// Make the next webhook-uid lookup fail as a dropped connection would.
    #[cfg(test)]
    pub fn fail_next_webhook_lookup(&self) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.fail_next_webhook_lookup = true;
        }
    }
}

fn matches_filter(status: DeploymentStatus, statuses: &[DeploymentStatus]) -> bool {
    statuses.is_empty() || statuses.contains(&status)
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_environment(&self, env: NewEnvironment) -> StoreResult<Environment> {
        self.with(|t| {
            let duplicate = t.environments.iter().any(|e| {
                e.project_id == env.project_id
                    && e.cluster_id == env.cluster_id
                    && e.git_installation_id == env.git_installation_id
                    && e.git_repo_owner == env.git_repo_owner
                    && e.git_repo_name == env.git_repo_name
            });
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "environment for {}/{} already exists",
                    env.git_repo_owner, env.git_repo_name
                )));
            }
            if t.environments.iter().any(|e| e.webhook_uid == env.webhook_uid) {
                return Err(StoreError::Conflict("webhook uid already in use".to_string()));
            }

            t.next_environment_id += 1;
            let now = Utc::now();
            let created = Environment {
                id: t.next_environment_id,
                project_id: env.project_id,
                cluster_id: env.cluster_id,
                git_installation_id: env.git_installation_id,
                git_repo_owner: env.git_repo_owner,
                git_repo_name: env.git_repo_name,
                name: env.name,
                mode: env.mode,
                git_repo_branches: env.git_repo_branches,
                git_deploy_branches: env.git_deploy_branches,
                new_comments_disabled: env.new_comments_disabled,
                namespace_labels: env.namespace_labels,
                webhook_uid: env.webhook_uid,
                github_webhook_id: 0,
                created_at: now,
                updated_at: now,
            };
            t.environments.push(created.clone());
            Ok(created)
        })
    }

    async fn read_environment(&self, key: &EnvironmentKey) -> StoreResult<Environment> {
        self.with(|t| {
            t.environments
                .iter()
                .find(|e| e.key() == *key)
                .cloned()
                .ok_or(StoreError::NotFound("environment"))
        })
    }

    async fn read_environment_by_id(
        &self,
        project_id: i64,
        cluster_id: i64,
        id: i64,
    ) -> StoreResult<Environment> {
        self.with(|t| {
            t.environments
                .iter()
                .find(|e| e.id == id && e.project_id == project_id && e.cluster_id == cluster_id)
                .cloned()
                .ok_or(StoreError::NotFound("environment"))
        })
    }

    async fn read_environment_by_owner_repo_name(
        &self,
        project_id: i64,
        cluster_id: i64,
        owner: &str,
        name: &str,
    ) -> StoreResult<Environment> {
        self.with(|t| {
            t.environments
                .iter()
                .find(|e| {
                    e.project_id == project_id
                        && e.cluster_id == cluster_id
                        && e.git_repo_owner == owner
                        && e.git_repo_name == name
                })
                .cloned()
                .ok_or(StoreError::NotFound("environment"))
        })
    }

    async fn read_environment_by_webhook_id(
        &self,
        webhook_uid: &str,
        owner: &str,
        name: &str,
    ) -> StoreResult<Environment> {
        self.with(|t| {
            if t.take_injected_lookup_failure() {
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            t.environments
                .iter()
                .find(|e| e.webhook_uid == webhook_uid && e.git_repo_owner == owner && e.git_repo_name == name)
                .cloned()
                .ok_or(StoreError::NotFound("environment"))
        })
    }

    async fn list_environments(&self, project_id: i64, cluster_id: i64) -> StoreResult<Vec<Environment>> {
        self.with(|t| {
            let mut envs: Vec<Environment> = t
                .environments
                .iter()
                .filter(|e| e.project_id == project_id && e.cluster_id == cluster_id)
                .cloned()
                .collect();
            envs.sort_by_key(|e| (e.created_at, e.id));
            Ok(envs)
        })
    }

    async fn update_environment(&self, env: &Environment) -> StoreResult<Environment> {
        self.with(|t| {
            let slot = t
                .environments
                .iter_mut()
                .find(|e| e.id == env.id)
                .ok_or(StoreError::NotFound("environment"))?;
            let mut updated = env.clone();
            updated.webhook_uid = slot.webhook_uid.clone();
            updated.created_at = slot.created_at;
            updated.updated_at = Utc::now();
            *slot = updated.clone();
            Ok(updated)
        })
    }

    async fn delete_environment(&self, id: i64) -> StoreResult<()> {
        self.with(|t| {
            let before = t.environments.len();
            t.environments.retain(|e| e.id != id);
            if t.environments.len() == before {
                return Err(StoreError::NotFound("environment"));
            }
            let orphaned: Vec<i64> = t
                .deployments
                .iter()
                .filter(|d| d.environment_id == id)
                .map(|d| d.id)
                .collect();
            t.deployments.retain(|d| d.environment_id != id);
            t.revisions.retain(|r| !orphaned.contains(&r.deployment_id));
            Ok(())
        })
    }

    async fn create_deployment(&self, deployment: NewDeployment) -> StoreResult<Deployment> {
        self.with(|t| {
            if t.take_injected_insert_failure() {
                return Err(StoreError::Conflict(format!(
                    "deployment for namespace {} already exists",
                    deployment.namespace
                )));
            }

            if !t.environments.iter().any(|e| e.id == deployment.environment_id) {
                return Err(StoreError::NotFound("environment"));
            }
            if t
                .deployments
                .iter()
                .any(|d| d.environment_id == deployment.environment_id && d.namespace == deployment.namespace)
            {
                return Err(StoreError::Conflict(format!(
                    "deployment for namespace {} already exists",
                    deployment.namespace
                )));
            }

            t.next_deployment_id += 1;
            let now = Utc::now();
            let created = Deployment {
                id: t.next_deployment_id,
                environment_id: deployment.environment_id,
                namespace: deployment.namespace,
                status: deployment.status,
                subdomain: None,
                pull_request_id: deployment.pull_request_id,
                pr_branch_from: deployment.pr_branch_from,
                gh_deployment_id: deployment.gh_deployment_id,
                gh_pr_comment_id: 0,
                last_errors: String::new(),
                github_metadata: deployment.github_metadata,
                version: 1,
                created_at: now,
                updated_at: now,
            };
            t.deployments.push(created.clone());
            t.append_revision(&created);
            Ok(created)
        })
    }

    async fn read_deployment(&self, environment_id: i64, namespace: &str) -> StoreResult<Deployment> {
        self.with(|t| {
            t.deployments
                .iter()
                .find(|d| d.environment_id == environment_id && d.namespace == namespace)
                .cloned()
                .ok_or(StoreError::NotFound("deployment"))
        })
    }

    async fn read_deployment_by_id(
        &self,
        project_id: i64,
        cluster_id: i64,
        id: i64,
    ) -> StoreResult<Deployment> {
        self.with(|t| {
            t.deployments
                .iter()
                .find(|d| d.id == id && t.environment_in_scope(d.environment_id, project_id, cluster_id))
                .cloned()
                .ok_or(StoreError::NotFound("deployment"))
        })
    }

    async fn read_deployment_by_cluster(
        &self,
        project_id: i64,
        cluster_id: i64,
        namespace: &str,
    ) -> StoreResult<Deployment> {
        self.with(|t| {
            t.deployments
                .iter()
                .find(|d| {
                    d.namespace == namespace && t.environment_in_scope(d.environment_id, project_id, cluster_id)
                })
                .cloned()
                .ok_or(StoreError::NotFound("deployment"))
        })
    }

    async fn read_deployment_by_git_details(
        &self,
        environment_id: i64,
        owner: &str,
        name: &str,
        pr_number: i64,
    ) -> StoreResult<Deployment> {
        self.with(|t| {
            t.deployments
                .iter()
                .rev()
                .find(|d| {
                    d.environment_id == environment_id
                        && d.pull_request_id == pr_number
                        && d.github_metadata.repo_owner == owner
                        && d.github_metadata.repo_name == name
                })
                .cloned()
                .ok_or(StoreError::NotFound("deployment"))
        })
    }

    async fn read_deployment_for_branch(
        &self,
        environment_id: i64,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> StoreResult<Deployment> {
        self.with(|t| {
            t.deployments
                .iter()
                .rev()
                .find(|d| {
                    d.environment_id == environment_id
                        && d.pull_request_id == 0
                        && d.pr_branch_from == branch
                        && d.github_metadata.repo_owner == owner
                        && d.github_metadata.repo_name == name
                })
                .cloned()
                .ok_or(StoreError::NotFound("deployment"))
        })
    }

    async fn list_deployments(
        &self,
        environment_id: i64,
        statuses: &[DeploymentStatus],
    ) -> StoreResult<Vec<Deployment>> {
        self.with(|t| {
            Ok(t.deployments
                .iter()
                .filter(|d| d.environment_id == environment_id && matches_filter(d.status, statuses))
                .cloned()
                .collect())
        })
    }

    async fn list_deployments_by_cluster(
        &self,
        project_id: i64,
        cluster_id: i64,
        statuses: &[DeploymentStatus],
    ) -> StoreResult<Vec<Deployment>> {
        self.with(|t| {
            Ok(t.deployments
                .iter()
                .filter(|d| {
                    t.environment_in_scope(d.environment_id, project_id, cluster_id)
                        && matches_filter(d.status, statuses)
                })
                .cloned()
                .collect())
        })
    }

    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        self.with(|t| {
            let slot = t
                .deployments
                .iter_mut()
                .find(|d| d.id == deployment.id)
                .ok_or(StoreError::NotFound("deployment"))?;
            if slot.version != deployment.version {
                return Err(StoreError::StaleVersion {
                    id: deployment.id,
                    expected: deployment.version,
                });
            }

            let status_changed = slot.status != deployment.status;
            let mut updated = deployment.clone();
            updated.environment_id = slot.environment_id;
            updated.namespace = slot.namespace.clone();
            updated.created_at = slot.created_at;
            updated.version = slot.version + 1;
            updated.updated_at = Utc::now();
            *slot = updated.clone();

            if status_changed {
                t.append_revision(&updated);
            }
            Ok(updated)
        })
    }

    async fn delete_deployment(&self, id: i64) -> StoreResult<()> {
        self.with(|t| {
            let before = t.deployments.len();
            t.deployments.retain(|d| d.id != id);
            if t.deployments.len() == before {
                return Err(StoreError::NotFound("deployment"));
            }
            t.revisions.retain(|r| r.deployment_id != id);
            Ok(())
        })
    }

    async fn list_deployment_revisions(&self, deployment_id: i64) -> StoreResult<Vec<DeploymentRevision>> {
        self.with(|t| {
            let mut revisions: Vec<DeploymentRevision> = t
                .revisions
                .iter()
                .filter(|r| r.deployment_id == deployment_id)
                .cloned()
                .collect();
            revisions.sort_by_key(|r| r.revision);
            Ok(revisions)
        })
    }
}
