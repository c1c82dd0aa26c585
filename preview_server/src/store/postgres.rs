//! PostgreSQL store backend (diesel-async over a deadpool pool).

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use crate::models::deployment::{
    Deployment, DeploymentChangeset, DeploymentRow, DeploymentStatus, NewDeployment, NewDeploymentRow,
};
use crate::models::environment::{
    Environment, EnvironmentChangeset, EnvironmentKey, EnvironmentRow, NewEnvironment, NewEnvironmentRow,
};
use crate::models::revision::{DeploymentRevision, NewRevisionRow, RevisionRow};
use crate::schema::{preview_deployment_revisions, preview_deployments, preview_environments};
use crate::store::{Store, StoreError, StoreResult};

pub type PgPool = Pool<AsyncPgConnection>;

/// Build a pooled connection manager for `database_url`.
pub fn build_pool(database_url: &str, max_size: usize) -> anyhow::Result<PgPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
    Ok(pool)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> StoreResult<Object<AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Backend(format!("diesel pool: {e}")))
    }
}

fn classify(e: DieselError, what: &'static str) -> StoreError {
    match e {
        DieselError::NotFound => StoreError::NotFound(what),
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            StoreError::Conflict(format!("{what} already exists: {}", info.message()))
        }
        other => StoreError::Backend(other.to_string()),
    }
}

impl From<DieselError> for StoreError {
    fn from(e: DieselError) -> Self {
        classify(e, "row")
    }
}

fn to_deployment(row: DeploymentRow) -> StoreResult<Deployment> {
    Deployment::try_from(row).map_err(StoreError::Backend)
}

fn to_deployments(rows: Vec<DeploymentRow>) -> StoreResult<Vec<Deployment>> {
    rows.into_iter().map(to_deployment).collect()
}

fn status_strings(statuses: &[DeploymentStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

async fn append_revision(
    conn: &mut AsyncPgConnection,
    deployment_id: i64,
    status: &str,
    commit_sha: &str,
) -> StoreResult<()> {
    let latest: Option<i32> = preview_deployment_revisions::table
        .filter(preview_deployment_revisions::deployment_id.eq(deployment_id))
        .select(diesel::dsl::max(preview_deployment_revisions::revision))
        .first(conn)
        .await?;

    diesel::insert_into(preview_deployment_revisions::table)
        .values(NewRevisionRow {
            deployment_id,
            revision: latest.unwrap_or(0) + 1,
            status: status.to_string(),
            commit_sha: commit_sha.to_string(),
        })
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn create_environment(&self, env: NewEnvironment) -> StoreResult<Environment> {
        let mut conn = self.conn().await?;
        let row: EnvironmentRow = diesel::insert_into(preview_environments::table)
            .values(NewEnvironmentRow::from(&env))
            .returning(EnvironmentRow::as_returning())
            .get_result(&mut *conn)
            .await
            .map_err(|e| classify(e, "environment"))?;
        Ok(row.into())
    }

    async fn read_environment(&self, key: &EnvironmentKey) -> StoreResult<Environment> {
        let mut conn = self.conn().await?;
        let row: EnvironmentRow = preview_environments::table
            .filter(preview_environments::project_id.eq(key.project_id))
            .filter(preview_environments::cluster_id.eq(key.cluster_id))
            .filter(preview_environments::git_installation_id.eq(key.installation_id))
            .filter(preview_environments::git_repo_owner.eq(&key.owner))
            .filter(preview_environments::git_repo_name.eq(&key.name))
            .select(EnvironmentRow::as_select())
            .first(&mut *conn)
            .await
            .map_err(|e| classify(e, "environment"))?;
        Ok(row.into())
    }

    async fn read_environment_by_id(
        &self,
        project_id: i64,
        cluster_id: i64,
        id: i64,
    ) -> StoreResult<Environment> {
        let mut conn = self.conn().await?;
        let row: EnvironmentRow = preview_environments::table
            .filter(preview_environments::id.eq(id))
            .filter(preview_environments::project_id.eq(project_id))
            .filter(preview_environments::cluster_id.eq(cluster_id))
            .select(EnvironmentRow::as_select())
            .first(&mut *conn)
            .await
            .map_err(|e| classify(e, "environment"))?;
        Ok(row.into())
    }

    async fn read_environment_by_owner_repo_name(
        &self,
        project_id: i64,
        cluster_id: i64,
        owner: &str,
        name: &str,
    ) -> StoreResult<Environment> {
        let mut conn = self.conn().await?;
        let row: EnvironmentRow = preview_environments::table
            .filter(preview_environments::project_id.eq(project_id))
            .filter(preview_environments::cluster_id.eq(cluster_id))
            .filter(preview_environments::git_repo_owner.eq(owner))
            .filter(preview_environments::git_repo_name.eq(name))
            .order(preview_environments::id.asc())
            .select(EnvironmentRow::as_select())
            .first(&mut *conn)
            .await
            .map_err(|e| classify(e, "environment"))?;
        Ok(row.into())
    }

    async fn read_environment_by_webhook_id(
        &self,
        webhook_uid: &str,
        owner: &str,
        name: &str,
    ) -> StoreResult<Environment> {
        let mut conn = self.conn().await?;
        let row: EnvironmentRow = preview_environments::table
            .filter(preview_environments::webhook_uid.eq(webhook_uid))
            .filter(preview_environments::git_repo_owner.eq(owner))
            .filter(preview_environments::git_repo_name.eq(name))
            .select(EnvironmentRow::as_select())
            .first(&mut *conn)
            .await
            .map_err(|e| classify(e, "environment"))?;
        Ok(row.into())
    }

    async fn list_environments(&self, project_id: i64, cluster_id: i64) -> StoreResult<Vec<Environment>> {
        let mut conn = self.conn().await?;
        let rows: Vec<EnvironmentRow> = preview_environments::table
            .filter(preview_environments::project_id.eq(project_id))
            .filter(preview_environments::cluster_id.eq(cluster_id))
            .order((preview_environments::created_at.asc(), preview_environments::id.asc()))
            .select(EnvironmentRow::as_select())
            .load(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(Environment::from).collect())
    }

    async fn update_environment(&self, env: &Environment) -> StoreResult<Environment> {
        let mut conn = self.conn().await?;
        let row: EnvironmentRow = diesel::update(preview_environments::table.find(env.id))
            .set(EnvironmentChangeset::from(env))
            .returning(EnvironmentRow::as_returning())
            .get_result(&mut *conn)
            .await
            .map_err(|e| classify(e, "environment"))?;
        Ok(row.into())
    }

    async fn delete_environment(&self, id: i64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(preview_environments::table.find(id))
            .execute(&mut *conn)
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound("environment"));
        }
        Ok(())
    }

    async fn create_deployment(&self, deployment: NewDeployment) -> StoreResult<Deployment> {
        let mut conn = self.conn().await?;
        let row = conn
            .transaction::<_, StoreError, _>(|conn| {
                async move {
                    let row: DeploymentRow = diesel::insert_into(preview_deployments::table)
                        .values(NewDeploymentRow::from(&deployment))
                        .returning(DeploymentRow::as_returning())
                        .get_result(conn)
                        .await
                        .map_err(|e| classify(e, "deployment"))?;
                    append_revision(conn, row.id, &row.status, &row.commit_sha).await?;
                    Ok(row)
                }
                .scope_boxed()
            })
            .await?;
        to_deployment(row)
    }

    async fn read_deployment(&self, environment_id: i64, namespace: &str) -> StoreResult<Deployment> {
        let mut conn = self.conn().await?;
        let row: DeploymentRow = preview_deployments::table
            .filter(preview_deployments::environment_id.eq(environment_id))
            .filter(preview_deployments::namespace.eq(namespace))
            .select(DeploymentRow::as_select())
            .first(&mut *conn)
            .await
            .map_err(|e| classify(e, "deployment"))?;
        to_deployment(row)
    }

    async fn read_deployment_by_id(
        &self,
        project_id: i64,
        cluster_id: i64,
        id: i64,
    ) -> StoreResult<Deployment> {
        let mut conn = self.conn().await?;
        let row: DeploymentRow = preview_deployments::table
            .inner_join(preview_environments::table)
            .filter(preview_deployments::id.eq(id))
            .filter(preview_environments::project_id.eq(project_id))
            .filter(preview_environments::cluster_id.eq(cluster_id))
            .select(DeploymentRow::as_select())
            .first(&mut *conn)
            .await
            .map_err(|e| classify(e, "deployment"))?;
        to_deployment(row)
    }

    async fn read_deployment_by_cluster(
        &self,
        project_id: i64,
        cluster_id: i64,
        namespace: &str,
    ) -> StoreResult<Deployment> {
        let mut conn = self.conn().await?;
        let row: DeploymentRow = preview_deployments::table
            .inner_join(preview_environments::table)
            .filter(preview_deployments::namespace.eq(namespace))
            .filter(preview_environments::project_id.eq(project_id))
            .filter(preview_environments::cluster_id.eq(cluster_id))
            .order(preview_deployments::id.desc())
            .select(DeploymentRow::as_select())
            .first(&mut *conn)
            .await
            .map_err(|e| classify(e, "deployment"))?;
        to_deployment(row)
    }

    async fn read_deployment_by_git_details(
        &self,
        environment_id: i64,
        owner: &str,
        name: &str,
        pr_number: i64,
    ) -> StoreResult<Deployment> {
        let mut conn = self.conn().await?;
        let row: DeploymentRow = preview_deployments::table
            .filter(preview_deployments::environment_id.eq(environment_id))
            .filter(preview_deployments::gh_repo_owner.eq(owner))
            .filter(preview_deployments::gh_repo_name.eq(name))
            .filter(preview_deployments::pull_request_id.eq(pr_number))
            .order(preview_deployments::id.desc())
            .select(DeploymentRow::as_select())
            .first(&mut *conn)
            .await
            .map_err(|e| classify(e, "deployment"))?;
        to_deployment(row)
    }

    async fn read_deployment_for_branch(
        &self,
        environment_id: i64,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> StoreResult<Deployment> {
        let mut conn = self.conn().await?;
        let row: DeploymentRow = preview_deployments::table
            .filter(preview_deployments::environment_id.eq(environment_id))
            .filter(preview_deployments::gh_repo_owner.eq(owner))
            .filter(preview_deployments::gh_repo_name.eq(name))
            .filter(preview_deployments::pull_request_id.eq(0_i64))
            .filter(preview_deployments::pr_branch_from.eq(branch))
            .order(preview_deployments::id.desc())
            .select(DeploymentRow::as_select())
            .first(&mut *conn)
            .await
            .map_err(|e| classify(e, "deployment"))?;
        to_deployment(row)
    }

    async fn list_deployments(
        &self,
        environment_id: i64,
        statuses: &[DeploymentStatus],
    ) -> StoreResult<Vec<Deployment>> {
        let mut conn = self.conn().await?;
        let mut query = preview_deployments::table
            .filter(preview_deployments::environment_id.eq(environment_id))
            .order(preview_deployments::id.asc())
            .select(DeploymentRow::as_select())
            .into_boxed();
        if !statuses.is_empty() {
            query = query.filter(preview_deployments::status.eq_any(status_strings(statuses)));
        }
        let rows: Vec<DeploymentRow> = query.load(&mut *conn).await?;
        to_deployments(rows)
    }

    async fn list_deployments_by_cluster(
        &self,
        project_id: i64,
        cluster_id: i64,
        statuses: &[DeploymentStatus],
    ) -> StoreResult<Vec<Deployment>> {
        let mut conn = self.conn().await?;
        let mut query = preview_deployments::table
            .inner_join(preview_environments::table)
            .filter(preview_environments::project_id.eq(project_id))
            .filter(preview_environments::cluster_id.eq(cluster_id))
            .order(preview_deployments::id.asc())
            .select(DeploymentRow::as_select())
            .into_boxed();
        if !statuses.is_empty() {
            query = query.filter(preview_deployments::status.eq_any(status_strings(statuses)));
        }
        let rows: Vec<DeploymentRow> = query.load(&mut *conn).await?;
        to_deployments(rows)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> StoreResult<Deployment> {
        let id = deployment.id;
        let expected = deployment.version;
        let changes = DeploymentChangeset::next_version_of(deployment);

        let mut conn = self.conn().await?;
        let row = conn
            .transaction::<_, StoreError, _>(|conn| {
                async move {
                    let previous: String = preview_deployments::table
                        .find(id)
                        .select(preview_deployments::status)
                        .first(conn)
                        .await
                        .map_err(|e| classify(e, "deployment"))?;

                    let row: DeploymentRow = diesel::update(
                        preview_deployments::table
                            .filter(preview_deployments::id.eq(id))
                            .filter(preview_deployments::version.eq(expected)),
                    )
                    .set(&changes)
                    .returning(DeploymentRow::as_returning())
                    .get_result(conn)
                    .await
                    .optional()?
                    .ok_or(StoreError::StaleVersion { id, expected })?;

                    if row.status != previous {
                        append_revision(conn, row.id, &row.status, &row.commit_sha).await?;
                    }
                    Ok(row)
                }
                .scope_boxed()
            })
            .await?;
        to_deployment(row)
    }

    async fn delete_deployment(&self, id: i64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(preview_deployments::table.find(id))
            .execute(&mut *conn)
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound("deployment"));
        }
        Ok(())
    }

    async fn list_deployment_revisions(&self, deployment_id: i64) -> StoreResult<Vec<DeploymentRevision>> {
        let mut conn = self.conn().await?;
        let rows: Vec<RevisionRow> = preview_deployment_revisions::table
            .filter(preview_deployment_revisions::deployment_id.eq(deployment_id))
            .order(preview_deployment_revisions::revision.asc())
            .select(RevisionRow::as_select())
            .load(&mut *conn)
            .await?;
        rows.into_iter()
            .map(|row| DeploymentRevision::try_from(row).map_err(StoreError::Backend))
            .collect()
    }
}
