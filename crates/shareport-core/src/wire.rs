//! Request and response bodies of the store REST API
//!
//! Shared by the server and the HTTP store client so both sides agree on the
//! wire format.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
#[cfg(feature = "openapi")]
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::model::{DeviceStatus, SessionScope, SessionStatus, TunnelSession};

/// Body of `POST /api/device-requests`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct CreateDeviceRequest {
    pub device_code: String,
}

/// Body of `PATCH /api/device-requests/{code}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct DeviceTransition {
    pub from: DeviceStatus,
    pub to: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

/// Body of `PATCH /api/tunnels/{id}/heartbeat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct HeartbeatUpdate {
    pub at: DateTime<Utc>,
    /// Also set the session back to online if it was swept offline
    #[serde(default)]
    pub revive: bool,
}

/// Response of `POST /api/tunnels`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RegisteredSession {
    pub session: TunnelSession,
    /// Send back in [`SESSION_KEY_HEADER`] on heartbeat, status and delete
    pub write_key: String,
}

/// Body of `PATCH /api/tunnels/{id}/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct StatusUpdate {
    pub status: SessionStatus,
}

/// Result of a conditional write: whether a row actually changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct MutationResult {
    pub updated: bool,
}

/// Team as visible to its members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct TeamInfo {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
}

/// Query string selecting a [`SessionScope`] (`?scope=team&id=...`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema, IntoParams))]
#[cfg_attr(feature = "openapi", into_params(parameter_in = Query))]
pub struct ScopeQuery {
    /// `owner`, `team` or `community`
    pub scope: String,
    /// User or team id; unused for `community`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

impl ScopeQuery {
    pub fn to_scope(&self) -> Result<SessionScope, String> {
        SessionScope::from_parts(&self.scope, self.id)
    }
}

impl From<&SessionScope> for ScopeQuery {
    fn from(scope: &SessionScope) -> Self {
        Self {
            scope: scope.kind().to_string(),
            id: scope.id(),
        }
    }
}

/// Payload of a `lagged` feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaggedNotice {
    pub skipped: u64,
}

/// Header carrying a session's write key
pub const SESSION_KEY_HEADER: &str = "x-session-key";

const WRITE_KEY_LEN: usize = 40;

/// Fresh random write key for a new session
pub fn generate_write_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(WRITE_KEY_LEN)
        .map(char::from)
        .collect()
}

/// SSE event name carrying a [`crate::ChangeEvent`]
pub const CHANGE_EVENT: &str = "change";

/// SSE event name carrying a [`LaggedNotice`]
pub const LAGGED_EVENT: &str = "lagged";
