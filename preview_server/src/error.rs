//! Service error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::services::cluster::ClusterError;
use crate::services::github::ScmError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

pub type PreviewResult<T> = Result<T, PreviewError>;

/// Stable reason returned whenever an operation targets a closed pull request.
pub const PR_CLOSED: &str = "pull request is closed";

impl PreviewError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn pr_closed() -> Self {
        Self::Conflict(PR_CLOSED.to_string())
    }
}

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{self}");
        } else {
            tracing::debug!(status = status.as_u16(), "{self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<StoreError> for PreviewError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            StoreError::Conflict(what) => Self::Conflict(what),
            StoreError::StaleVersion { .. } => Self::Conflict(e.to_string()),
            StoreError::Backend(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<ScmError> for PreviewError {
    fn from(e: ScmError) -> Self {
        match e {
            ScmError::NotFound(what) => Self::NotFound(format!("{what} not found on GitHub")),
            ScmError::Conflict(msg) => Self::Conflict(msg),
            ScmError::Unauthenticated(msg) => Self::Unauthenticated(msg),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<ClusterError> for PreviewError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::ProtectedNamespace(ns) => {
                Self::BadRequest(format!("namespace {ns} is a protected system namespace"))
            }
            other => Self::Upstream(other.to_string()),
        }
    }
}
