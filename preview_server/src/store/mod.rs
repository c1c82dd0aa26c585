//! Persistence contract for environments, deployments and their revisions.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::deployment::{Deployment, DeploymentStatus, NewDeployment};
use crate::models::environment::{Environment, EnvironmentKey, NewEnvironment};
use crate::models::revision::DeploymentRevision;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("deployment {id} was modified concurrently (expected version {expected})")]
    StaleVersion { id: i64, expected: i32 },
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `Conflict` on a duplicate identity or webhook uid.
    async fn create_environment(&self, env: NewEnvironment) -> StoreResult<Environment>;

    async fn read_environment(&self, key: &EnvironmentKey) -> StoreResult<Environment>;

    async fn read_environment_by_id(
        &self,
        project_id: i64,
        cluster_id: i64,
        id: i64,
    ) -> StoreResult<Environment>;

    async fn read_environment_by_owner_repo_name(
        &self,
        project_id: i64,
        cluster_id: i64,
        owner: &str,
        name: &str,
    ) -> StoreResult<Environment>;

    async fn read_environment_by_webhook_id(
        &self,
        webhook_uid: &str,
        owner: &str,
        name: &str,
    ) -> StoreResult<Environment>;

    /// Ordered by creation time.
    async fn list_environments(&self, project_id: i64, cluster_id: i64) -> StoreResult<Vec<Environment>>;

    async fn update_environment(&self, env: &Environment) -> StoreResult<Environment>;

    /// Removes the environment row. Deployments are the caller's to clean up first.
    async fn delete_environment(&self, id: i64) -> StoreResult<()>;

    /// Fails with `Conflict` when `(environment_id, namespace)` already exists.
    async fn create_deployment(&self, deployment: NewDeployment) -> StoreResult<Deployment>;

    async fn read_deployment(&self, environment_id: i64, namespace: &str) -> StoreResult<Deployment>;

    async fn read_deployment_by_id(
        &self,
        project_id: i64,
        cluster_id: i64,
        id: i64,
    ) -> StoreResult<Deployment>;

    async fn read_deployment_by_cluster(
        &self,
        project_id: i64,
        cluster_id: i64,
        namespace: &str,
    ) -> StoreResult<Deployment>;

    async fn read_deployment_by_git_details(
        &self,
        environment_id: i64,
        owner: &str,
        name: &str,
        pr_number: i64,
    ) -> StoreResult<Deployment>;

    async fn read_deployment_for_branch(
        &self,
        environment_id: i64,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> StoreResult<Deployment>;

    /// An empty status filter lists every deployment.
    async fn list_deployments(
        &self,
        environment_id: i64,
        statuses: &[DeploymentStatus],
    ) -> StoreResult<Vec<Deployment>>;

    async fn list_deployments_by_cluster(
        &self,
        project_id: i64,
        cluster_id: i64,
        statuses: &[DeploymentStatus],
    ) -> StoreResult<Vec<Deployment>>;

    /// Writes `deployment` if its `version` is still current, returning the
    /// row with a bumped version. A status change appends a revision.
    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment>;

    async fn delete_deployment(&self, id: i64) -> StoreResult<()>;

    /// Oldest first.
    async fn list_deployment_revisions(&self, deployment_id: i64) -> StoreResult<Vec<DeploymentRevision>>;
}
