//! Response bodies owned by the API server
//!
//! Row types and request bodies are shared with the client and live in
//! `shareport_core::{model, wire}`.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Open change feed subscriptions
    pub feed_subscribers: usize,
}

/// Query of the device authorization page
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DevicePageQuery {
    /// Device code shown by the CLI
    pub code: Option<String>,
}

/// Form posted by the approve button
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ApproveForm {
    pub code: String,
    /// Token embedded in the confirm page
    #[serde(default)]
    pub csrf_token: String,
}
