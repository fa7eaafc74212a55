//! `device_requests` endpoints
//!
//! The device code itself is the capability: anyone holding it may read the
//! row. Only a signed-in user may approve it, and only for themselves.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use shareport_core::wire::{CreateDeviceRequest, DeviceTransition, MutationResult};
use shareport_core::{DeviceRequest, DeviceStatus, SessionStore, StoreError};
use std::sync::Arc;
use tracing::{debug, info};

use super::{api_error, store_error, ApiError};
use crate::middleware::Caller;
use crate::models::ErrorResponse;
use crate::AppState;

/// Longest device code accepted from clients
const MAX_DEVICE_CODE_LEN: usize = 64;

/// Register a pending device request
#[utoipa::path(
    post,
    path = "/api/device-requests",
    request_body = CreateDeviceRequest,
    responses(
        (status = 201, description = "Request created", body = DeviceRequest),
        (status = 400, description = "Malformed device code", body = ErrorResponse),
        (status = 409, description = "Device code already in use", body = ErrorResponse)
    ),
    tag = "device"
)]
pub async fn create_device_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<DeviceRequest>), ApiError> {
    let code = req.device_code.trim();
    if code.is_empty()
        || code.len() > MAX_DEVICE_CODE_LEN
        || !code.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_DEVICE_CODE",
            "Device codes are 1-64 ASCII letters or digits",
        ));
    }

    let request = state
        .store
        .insert_device_request(code)
        .await
        .map_err(|e| match e {
            StoreError::Conflict(_) => api_error(
                StatusCode::CONFLICT,
                "CODE_EXISTS",
                format!("Device code '{}' is already in use", code),
            ),
            other => store_error(other),
        })?;

    debug!("Registered device request {}", request.device_code);
    Ok((StatusCode::CREATED, Json(request)))
}

/// Read a device request
#[utoipa::path(
    get,
    path = "/api/device-requests/{code}",
    params(
        ("code" = String, Path, description = "Device code")
    ),
    responses(
        (status = 200, description = "Device request", body = DeviceRequest),
        (status = 404, description = "Unknown device code", body = ErrorResponse)
    ),
    tag = "device"
)]
pub async fn get_device_request(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<DeviceRequest>, ApiError> {
    state
        .store
        .find_device_request(&code)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| not_found(&code))
}

/// Compare-and-set the status of a device request
///
/// `pending -> approved` requires a caller whose id equals `user_id`;
/// `pending -> expired` is allowed to anyone once the deadline has passed.
#[utoipa::path(
    patch,
    path = "/api/device-requests/{code}",
    params(
        ("code" = String, Path, description = "Device code")
    ),
    request_body = DeviceTransition,
    responses(
        (status = 200, description = "Whether the transition applied", body = MutationResult),
        (status = 401, description = "Approval requires a signed-in caller", body = ErrorResponse),
        (status = 403, description = "Transition not allowed for this caller", body = ErrorResponse),
        (status = 404, description = "Unknown device code", body = ErrorResponse)
    ),
    tag = "device"
)]
pub async fn transition_device_request(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(code): Path<String>,
    Json(req): Json<DeviceTransition>,
) -> Result<Json<MutationResult>, ApiError> {
    let request = state
        .store
        .find_device_request(&code)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found(&code))?;

    let user_id = match req.to {
        DeviceStatus::Pending => {
            return Err(api_error(
                StatusCode::FORBIDDEN,
                "INVALID_TRANSITION",
                "Device requests never return to pending",
            ));
        }
        DeviceStatus::Approved => {
            let caller_id = caller.require()?;
            if req.user_id != Some(caller_id) {
                return Err(api_error(
                    StatusCode::FORBIDDEN,
                    "USER_MISMATCH",
                    "A device request can only be approved for the signed-in user",
                ));
            }
            if request.is_past_deadline(Utc::now()) {
                return Err(api_error(
                    StatusCode::FORBIDDEN,
                    "REQUEST_EXPIRED",
                    format!("Device code '{}' has expired", code),
                ));
            }
            Some(caller_id)
        }
        DeviceStatus::Expired => {
            if !request.is_past_deadline(Utc::now()) {
                return Err(api_error(
                    StatusCode::FORBIDDEN,
                    "NOT_EXPIRED",
                    format!("Device code '{}' is still within its deadline", code),
                ));
            }
            None
        }
    };

    let updated = state
        .store
        .transition_device_request(&code, req.from, req.to, user_id)
        .await
        .map_err(store_error)?;

    if updated {
        info!("Device request {}: {} -> {}", code, req.from, req.to);
    }
    Ok(Json(MutationResult { updated }))
}

fn not_found(code: &str) -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        "DEVICE_REQUEST_NOT_FOUND",
        format!("Device code '{}' not found", code),
    )
}
