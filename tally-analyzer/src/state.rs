use std::sync::Arc;

use axum::{
    extract::{FromRef, Request},
    middleware,
    middleware::Next,
    response::IntoResponse,
    routing::get,
};
use axum::http::StatusCode;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::error::AppError;
use crate::service::ReportService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReportService>,
}

impl AppState {
    pub fn new(service: Arc<ReportService>) -> Self {
        Self { service }
    }

    fn router_without_state() -> axum::Router<Self> {
        axum::Router::new()
            .route("/reports", get(api::query).post(api::start))
            .route("/reports/:id", get(api::get))
            .layer(middleware::from_fn(method_not_allowed))
            .layer(TraceLayer::new_for_http())
    }

    pub fn into_router(self) -> axum::Router {
        Self::router_without_state().with_state(self)
    }
}

pub async fn method_not_allowed(req: Request, next: Next) -> impl IntoResponse {
    let resp = next.run(req).await;
    let status = resp.status();
    match status {
        StatusCode::METHOD_NOT_ALLOWED => Err(AppError::MethodNotAllowed),
        _ => Ok(resp),
    }
}

impl FromRef<AppState> for Arc<ReportService> {
    fn from_ref(state: &AppState) -> Arc<ReportService> {
        Arc::clone(&state.service)
    }
}
