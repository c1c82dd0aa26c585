//! Schema migration for the preview controller tables.

use diesel_async::AsyncPgConnection;
use diesel_async::SimpleAsyncConnection;

/// Idempotent SQL migration; safe to run on every start.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS preview_environments (
    id                    BIGSERIAL PRIMARY KEY,
    project_id            BIGINT NOT NULL,
    cluster_id            BIGINT NOT NULL,
    git_installation_id   BIGINT NOT NULL,
    git_repo_owner        VARCHAR(255) NOT NULL,
    git_repo_name         VARCHAR(255) NOT NULL,
    name                  VARCHAR(255) NOT NULL,
    mode                  VARCHAR(16) NOT NULL DEFAULT 'manual',
    git_repo_branches     TEXT[] NOT NULL DEFAULT '{}',
    git_deploy_branches   TEXT[] NOT NULL DEFAULT '{}',
    new_comments_disabled BOOLEAN NOT NULL DEFAULT FALSE,
    namespace_labels      JSONB NOT NULL DEFAULT '{}',
    webhook_uid           VARCHAR(64) NOT NULL,
    github_webhook_id     BIGINT NOT NULL DEFAULT 0,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_preview_environments_identity
    ON preview_environments (project_id, cluster_id, git_installation_id, git_repo_owner, git_repo_name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_preview_environments_webhook_uid
    ON preview_environments (webhook_uid);
CREATE INDEX IF NOT EXISTS idx_preview_environments_cluster
    ON preview_environments (project_id, cluster_id);

CREATE TABLE IF NOT EXISTS preview_deployments (
    id                BIGSERIAL PRIMARY KEY,
    environment_id    BIGINT NOT NULL REFERENCES preview_environments(id) ON DELETE CASCADE,
    namespace         VARCHAR(253) NOT NULL,
    status            VARCHAR(16) NOT NULL DEFAULT 'creating',
    subdomain         VARCHAR(512),
    pull_request_id   BIGINT NOT NULL DEFAULT 0,
    pr_branch_from    VARCHAR(255) NOT NULL DEFAULT '',
    gh_deployment_id  BIGINT NOT NULL DEFAULT 0,
    gh_pr_comment_id  BIGINT NOT NULL DEFAULT 0,
    last_errors       TEXT NOT NULL DEFAULT '',
    pr_name           VARCHAR(1024) NOT NULL DEFAULT '',
    commit_sha        VARCHAR(64) NOT NULL DEFAULT '',
    pr_branch_into    VARCHAR(255) NOT NULL DEFAULT '',
    gh_repo_owner     VARCHAR(255) NOT NULL DEFAULT '',
    gh_repo_name      VARCHAR(255) NOT NULL DEFAULT '',
    version           INTEGER NOT NULL DEFAULT 1,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_preview_deployments_namespace
    ON preview_deployments (environment_id, namespace);
CREATE INDEX IF NOT EXISTS idx_preview_deployments_pr
    ON preview_deployments (environment_id, pull_request_id);
CREATE INDEX IF NOT EXISTS idx_preview_deployments_status
    ON preview_deployments (status);

CREATE TABLE IF NOT EXISTS preview_deployment_revisions (
    id             BIGSERIAL PRIMARY KEY,
    deployment_id  BIGINT NOT NULL REFERENCES preview_deployments(id) ON DELETE CASCADE,
    revision       INTEGER NOT NULL,
    status         VARCHAR(16) NOT NULL,
    commit_sha     VARCHAR(64) NOT NULL DEFAULT '',
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (deployment_id, revision)
);
"#;

/// Run the preview controller migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("preview migration failed: {e}"))?;
    Ok(())
}
