use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::QueryRejection;
use serde::{Deserialize, Serialize};
use tally_wire::report::ReportIdError;
use tracing::{error, trace, warn};
use uuid::Uuid;

use crate::store::StoreError;

/// Errors produced by report generation and the report service. The
/// variants are kinds, not sources: the executor and the API layer decide
/// policy purely on the kind.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReportError {
    /// Maps a store failure observed while fetching something that must
    /// exist. `NotFound` keeps its identity; everything else aborts.
    pub fn from_store(err: StoreError, what: &str) -> Self {
        match err {
            StoreError::NotFound => ReportError::NotFound(what.to_string()),
            other => ReportError::Aborted(format!("{what}: {other}")),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    Json(#[from] JsonRejection),
    #[error("Invalid request: {0}")]
    QueryParams(#[from] QueryRejection),
    #[error("Invalid request: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("Malformed report id: {0}")]
    ReportId(#[from] ReportIdError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("Method not allowed")]
    MethodNotAllowed,
}

impl AppError {
    fn into_problem(self) -> Problem {
        let reference = Uuid::new_v4();

        match self {
            AppError::Json(err) => {
                trace!(%reference, "Received invalid JSON in request: {}", err);
                Problem::new(StatusCode::BAD_REQUEST, Some(err.to_string()), reference)
            }
            AppError::QueryParams(err) => {
                trace!(%reference, "Received invalid query parameters: {}", err);
                Problem::new(StatusCode::BAD_REQUEST, Some(err.to_string()), reference)
            }
            AppError::Validation(err) => {
                trace!(%reference, "Received invalid request: {}", err);
                Problem::new(StatusCode::BAD_REQUEST, Some(err.to_string()), reference)
            }
            AppError::ReportId(err) => {
                trace!(%reference, "Malformed report id: {}", err);
                Problem::new(StatusCode::BAD_REQUEST, Some(err.to_string()), reference)
            }
            AppError::Report(err) => {
                let status = match &err {
                    ReportError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                    ReportError::NotFound(_) => StatusCode::NOT_FOUND,
                    ReportError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
                    ReportError::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
                    ReportError::Aborted(_) => StatusCode::CONFLICT,
                    ReportError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(%reference, "{}", err);
                } else {
                    warn!(%reference, "{}", err);
                }
                Problem::new(status, Some(err.to_string()), reference)
            }
            AppError::MethodNotAllowed => {
                trace!(%reference, "Method not allowed");
                Problem::new(StatusCode::METHOD_NOT_ALLOWED, None, reference)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let problem = self.into_problem();
        (problem.status, Json(problem)).into_response()
    }
}

/// RFC 7807 style problem document returned for every API error.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Problem {
    pub title: Option<String>,
    #[serde(with = "status_code")]
    pub status: StatusCode,
    pub detail: Option<String>,
    pub instance: Option<String>,
}

impl Problem {
    fn new(status: StatusCode, detail: Option<String>, reference: Uuid) -> Self {
        Problem {
            title: Some(status.to_string()),
            status,
            detail,
            instance: Some(reference.to_string()),
        }
    }
}

mod status_code {
    use axum::http::StatusCode;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(status.as_u16())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StatusCode, D::Error> {
        let code = u16::deserialize(deserializer)?;
        StatusCode::from_u16(code).map_err(serde::de::Error::custom)
    }
}
