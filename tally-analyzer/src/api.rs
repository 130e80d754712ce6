//! HTTP handlers for the report query API.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::{async_trait, Json};
use axum_extra::extract::{Query, QueryRejection};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::{info, trace};
use validator::Validate;

use crate::error::AppError;
use crate::service::{GetReportResponse, ReportService, StartReportRequest, StartReportResponse};

pub type AppResponse<T> = Result<Json<T>, AppError>;

#[derive(Debug, Clone)]
pub struct ValidatedQuery<T>(pub T);

#[derive(Debug, Clone)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = axum::extract::rejection::JsonRejection>,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

#[async_trait]
impl<T, S> axum::extract::FromRequestParts<S> for ValidatedQuery<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Query<T>: axum::extract::FromRequestParts<S, Rejection = QueryRejection>,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        value.validate()?;
        Ok(ValidatedQuery(value))
    }
}

/// `POST /reports`: allocates and enqueues one report run.
pub async fn start(
    State(service): State<Arc<ReportService>>,
    ValidatedJson(request): ValidatedJson<StartReportRequest>,
) -> Result<(StatusCode, Json<StartReportResponse>), AppError> {
    trace!(?request);
    let response = service.start_report(&request).await?;
    info!(report_id = %response.report_id, "report run started");
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// `GET /reports/:id`: loads one report by its opaque id string.
pub async fn get(
    State(service): State<Arc<ReportService>>,
    Path(report_id): Path<String>,
) -> AppResponse<GetReportResponse> {
    let report = service.get_report(&report_id).await?;
    Ok(Json(report))
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct QueryParams {
    #[validate(range(min = 1))]
    pub customer_id: u32,
    #[validate(range(min = 1))]
    pub project_id: u32,
    #[validate(range(min = 1))]
    pub report_config_id: u32,
    /// Inclusive lower creation-time bound, seconds since the epoch.
    #[serde(default)]
    pub first_timestamp_seconds: i64,
    /// Exclusive upper creation-time bound, seconds since the epoch.
    pub limit_timestamp_seconds: i64,
}

/// `GET /reports`: streams metadata batches as newline-delimited JSON.
pub async fn query(
    State(service): State<Arc<ReportService>>,
    ValidatedQuery(params): ValidatedQuery<QueryParams>,
) -> Result<Response, AppError> {
    trace!(?params);
    let batches = service.query_reports(
        params.customer_id,
        params.project_id,
        params.report_config_id,
        params.first_timestamp_seconds,
        params.limit_timestamp_seconds,
    )?;

    let body = Body::from_stream(batches.map(|batch| {
        batch
            .map_err(axum::Error::new)
            .and_then(|batch| match serde_json::to_vec(&batch) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Ok(line)
                }
                Err(err) => Err(axum::Error::new(err)),
            })
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .map_err(|err| AppError::Report(crate::error::ReportError::Internal(err.to_string())))
}
