//! Rows shared between the CLI, the store and the dashboards
//!
//! Two logical tables carry the whole protocol:
//! - `device_requests`: one row per device-code login attempt
//! - `tunnels`: one row per tunnel session, heartbeated by the CLI that opened it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Owner recorded for sessions opened without a logged-in identity
pub const ANONYMOUS_USER_ID: Uuid = Uuid::nil();

/// Lifecycle of a device request
///
/// `Pending` moves to exactly one of the terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Waiting for a human to approve it in the browser
    Pending,
    /// Approved; `user_id` is set and immutable
    Approved,
    /// Deadline passed before anyone approved it
    Expired,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Approved => "approved",
            DeviceStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeviceStatus::Pending)
    }

    /// Whether `self -> to` is an allowed transition
    pub fn can_transition_to(&self, to: DeviceStatus) -> bool {
        matches!(
            (self, to),
            (DeviceStatus::Pending, DeviceStatus::Approved)
                | (DeviceStatus::Pending, DeviceStatus::Expired)
        )
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeviceStatus::Pending),
            "approved" => Ok(DeviceStatus::Approved),
            "expired" => Ok(DeviceStatus::Expired),
            _ => Err(format!("Unknown device request status: {}", s)),
        }
    }
}

/// A device-code login attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct DeviceRequest {
    /// Correlation key between the CLI and the browser
    pub device_code: String,
    pub status: DeviceStatus,
    /// Approving identity, set only on approval
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Assigned by the store at insert time
    pub expires_at: DateTime<Utc>,
}

impl DeviceRequest {
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Status as observed at `now`: a pending row past its deadline reads as expired.
    pub fn effective_status(&self, now: DateTime<Utc>) -> DeviceStatus {
        match self.status {
            DeviceStatus::Pending if self.is_past_deadline(now) => DeviceStatus::Expired,
            status => status,
        }
    }
}

/// Liveness of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Online,
    Offline,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Online => "online",
            SessionStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(SessionStatus::Online),
            "offline" => Ok(SessionStatus::Offline),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Who may see a tunnel session outside its owner/team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    /// Listed in the community listing while online
    #[default]
    Public,
    Private,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Private => "private",
        }
    }
}

impl std::fmt::Display for Privacy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Privacy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(Privacy::Public),
            "private" => Ok(Privacy::Private),
            _ => Err(format!("Unknown privacy setting: {}", s)),
        }
    }
}

/// A tunnel session row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct TunnelSession {
    pub id: Uuid,
    /// Owner, or [`ANONYMOUS_USER_ID`]
    pub user_id: Uuid,
    /// When set, every member of the team sees the session
    pub team_id: Option<Uuid>,
    /// Public address returned by the tunnel provider
    pub current_url: String,
    pub local_port: u16,
    pub status: SessionStatus,
    pub privacy: Privacy,
    pub created_at: DateTime<Utc>,
    /// Written only by the CLI process that created the row
    pub last_heartbeat: DateTime<Utc>,
}

/// How much of a session row a reader may see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowView {
    /// The owner sees the whole row
    Owner,
    /// Team members see which team a session is shared with but not who opened it
    Team,
    /// Everyone else sees neither owner nor team
    Public,
}

impl TunnelSession {
    /// Strip the fields `view` may not see. Owner ids double as credentials
    /// and never leave the owner's own views.
    pub fn redact(mut self, view: RowView) -> Self {
        match view {
            RowView::Owner => {}
            RowView::Team => self.user_id = ANONYMOUS_USER_ID,
            RowView::Public => {
                self.user_id = ANONYMOUS_USER_ID;
                self.team_id = None;
            }
        }
        self
    }
}

/// Fields supplied by the CLI when a session opens; the store assigns the rest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct NewTunnelSession {
    pub user_id: Uuid,
    pub team_id: Option<Uuid>,
    pub current_url: String,
    pub local_port: u16,
    pub privacy: Privacy,
}

impl NewTunnelSession {
    /// Materialize the row locally, as the store would on insert
    pub fn into_session(self, id: Uuid, now: DateTime<Utc>) -> TunnelSession {
        TunnelSession {
            id,
            user_id: self.user_id,
            team_id: self.team_id,
            current_url: self.current_url,
            local_port: self.local_port,
            status: SessionStatus::Online,
            privacy: self.privacy,
            created_at: now,
            last_heartbeat: now,
        }
    }
}

/// Filter a dashboard subscribes with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum SessionScope {
    /// Sessions owned by a user
    Owner(Uuid),
    /// Sessions shared with a team
    Team(Uuid),
    /// Online public sessions, visible to anyone
    Community,
}

impl SessionScope {
    pub fn matches(&self, session: &TunnelSession) -> bool {
        match self {
            SessionScope::Owner(user_id) => session.user_id == *user_id,
            SessionScope::Team(team_id) => session.team_id == Some(*team_id),
            SessionScope::Community => {
                session.status == SessionStatus::Online && session.privacy == Privacy::Public
            }
        }
    }

    /// What subscribers of this scope may see of a row
    pub fn view(&self) -> RowView {
        match self {
            SessionScope::Owner(_) => RowView::Owner,
            SessionScope::Team(_) => RowView::Team,
            SessionScope::Community => RowView::Public,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionScope::Owner(_) => "owner",
            SessionScope::Team(_) => "team",
            SessionScope::Community => "community",
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        match self {
            SessionScope::Owner(id) | SessionScope::Team(id) => Some(*id),
            SessionScope::Community => None,
        }
    }

    /// Rebuild a scope from its query-string form (`scope=team&id=...`)
    pub fn from_parts(kind: &str, id: Option<Uuid>) -> Result<Self, String> {
        match (kind, id) {
            ("owner", Some(id)) => Ok(SessionScope::Owner(id)),
            ("team", Some(id)) => Ok(SessionScope::Team(id)),
            ("community", _) => Ok(SessionScope::Community),
            ("owner" | "team", None) => Err(format!("Scope '{}' requires an id", kind)),
            _ => Err(format!("Unknown scope: {}", kind)),
        }
    }
}

impl std::fmt::Display for SessionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}:{}", self.kind(), id),
            None => f.write_str(self.kind()),
        }
    }
}

/// A row change on the `tunnels` table, as delivered by the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
    Insert { record: TunnelSession },
    Update { record: TunnelSession, old: TunnelSession },
    Delete { old: TunnelSession },
}

impl ChangeEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            ChangeEvent::Insert { record } | ChangeEvent::Update { record, .. } => record.id,
            ChangeEvent::Delete { old } => old.id,
        }
    }

    pub fn redact(self, view: RowView) -> Self {
        match self {
            ChangeEvent::Insert { record } => ChangeEvent::Insert {
                record: record.redact(view),
            },
            ChangeEvent::Update { record, old } => ChangeEvent::Update {
                record: record.redact(view),
                old: old.redact(view),
            },
            ChangeEvent::Delete { old } => ChangeEvent::Delete {
                old: old.redact(view),
            },
        }
    }

    /// Whether a subscriber with `scope` should receive this event.
    ///
    /// An update is delivered when the row matches the scope before or after
    /// the change, so subscribers learn when a row leaves their scope.
    pub fn concerns(&self, scope: &SessionScope) -> bool {
        match self {
            ChangeEvent::Insert { record } => scope.matches(record),
            ChangeEvent::Update { record, old } => scope.matches(record) || scope.matches(old),
            ChangeEvent::Delete { old } => scope.matches(old),
        }
    }
}
