use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errores visibles desde la API HTTP del coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("request inválido: {0}")]
    BadRequest(String),
    #[error("artefacto {0} no existe")]
    ArtifactMissing(String),
    #[error("job {0} no existe")]
    JobNotFound(String),
    #[error("worker {0} no está registrado")]
    WorkerNotFound(String),
    #[error("no se pudo resolver la entrada: {0}")]
    InputResolution(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Conflict(String),
    #[error("error interno: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ArtifactMissing(_) | Self::JobNotFound(_) | Self::WorkerNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::InputResolution(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<crate::artifacts::ArtifactError> for CoordinatorError {
    fn from(e: crate::artifacts::ArtifactError) -> Self {
        match e {
            crate::artifacts::ArtifactError::InvalidName(_) => Self::BadRequest(e.to_string()),
            crate::artifacts::ArtifactError::RevisionGone { .. } => Self::Conflict(e.to_string()),
            crate::artifacts::ArtifactError::Io(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<crate::jobs::JobError> for CoordinatorError {
    fn from(e: crate::jobs::JobError) -> Self {
        match e {
            crate::jobs::JobError::NotFound(id) => Self::JobNotFound(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cada_error_tiene_su_status() {
        assert_eq!(CoordinatorError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(CoordinatorError::ArtifactMissing("m".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            CoordinatorError::InputResolution("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(CoordinatorError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(CoordinatorError::Conflict("x".into()).status(), StatusCode::CONFLICT);
    }
}
