//! preview.deployment.revision: Append-only history of deployment transitions.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::models::deployment::DeploymentStatus;
use crate::schema::preview_deployment_revisions;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRevision {
    pub deployment_id: i64,
    pub revision: i32,
    pub status: DeploymentStatus,
    pub commit_sha: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = preview_deployment_revisions)]
pub struct RevisionRow {
    pub id: i64,
    pub deployment_id: i64,
    pub revision: i32,
    pub status: String,
    pub commit_sha: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = preview_deployment_revisions)]
pub struct NewRevisionRow {
    pub deployment_id: i64,
    pub revision: i32,
    pub status: String,
    pub commit_sha: String,
}

impl TryFrom<RevisionRow> for DeploymentRevision {
    type Error = String;

    fn try_from(row: RevisionRow) -> Result<Self, Self::Error> {
        let status = DeploymentStatus::parse(&row.status)
            .ok_or_else(|| format!("unknown revision status '{}' on row {}", row.status, row.id))?;
        Ok(Self {
            deployment_id: row.deployment_id,
            revision: row.revision,
            status,
            commit_sha: row.commit_sha,
            created_at: row.created_at,
        })
    }
}
