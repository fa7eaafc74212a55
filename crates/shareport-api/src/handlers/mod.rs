//! REST handlers
//!
//! Every handler receives the resolved [`crate::middleware::Caller`] and
//! applies the row-level rules for its table before touching the store.

pub mod device;
pub mod teams;
pub mod tunnels;

use axum::{extract::State, http::StatusCode, Json};
use shareport_core::StoreError;
use std::sync::Arc;
use tracing::error;
use utoipa::OpenApi;

use crate::models::{ErrorResponse, HealthResponse};
use crate::{ApiDoc, AppState};

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: Some(code.to_string()),
        }),
    )
}

/// Map a store failure onto the HTTP status the client maps back
pub fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::Unavailable(msg) => {
            error!("Store unavailable: {}", msg);
            api_error(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", msg)
        }
        StoreError::Conflict(msg) => api_error(StatusCode::CONFLICT, "CONFLICT", msg),
        StoreError::NotFound(msg) => api_error(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
        StoreError::Forbidden(msg) => api_error(StatusCode::FORBIDDEN, "FORBIDDEN", msg),
        StoreError::Backend(msg) => {
            error!("Store error: {}", msg);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", msg)
        }
    }
}

/// Health check
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        feed_subscribers: state.store.change_bus().subscriber_count(),
    })
}

/// OpenAPI document of this server
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
