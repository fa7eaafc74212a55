//! Tunnel entity, one row per tunnel session

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use shareport_core::model::{Privacy, SessionStatus, TunnelSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TunnelStatus {
    #[sea_orm(string_value = "online")]
    Online,

    #[sea_orm(string_value = "offline")]
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TunnelPrivacy {
    #[sea_orm(string_value = "public")]
    Public,

    #[sea_orm(string_value = "private")]
    Private,
}

impl From<SessionStatus> for TunnelStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Online => TunnelStatus::Online,
            SessionStatus::Offline => TunnelStatus::Offline,
        }
    }
}

impl From<TunnelStatus> for SessionStatus {
    fn from(status: TunnelStatus) -> Self {
        match status {
            TunnelStatus::Online => SessionStatus::Online,
            TunnelStatus::Offline => SessionStatus::Offline,
        }
    }
}

impl From<Privacy> for TunnelPrivacy {
    fn from(privacy: Privacy) -> Self {
        match privacy {
            Privacy::Public => TunnelPrivacy::Public,
            Privacy::Private => TunnelPrivacy::Private,
        }
    }
}

impl From<TunnelPrivacy> for Privacy {
    fn from(privacy: TunnelPrivacy) -> Self {
        match privacy {
            TunnelPrivacy::Public => Privacy::Public,
            TunnelPrivacy::Private => Privacy::Private,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    /// Session UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owner; the nil UUID for anonymous sessions, so no foreign key
    pub user_id: Uuid,

    /// Team the session is shared with (optional)
    pub team_id: Option<Uuid>,

    /// Public URL returned by the tunnel provider
    pub current_url: String,

    /// Local port being shared
    pub local_port: i32,

    pub status: TunnelStatus,

    pub privacy: TunnelPrivacy,

    /// When the session was opened
    pub created_at: ChronoDateTimeUtc,

    /// Written only by the CLI process that owns the session
    pub last_heartbeat: ChronoDateTimeUtc,

    /// Secret handed to the creating process; required for heartbeat, status and delete
    #[serde(skip_serializing)]
    pub write_key: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for TunnelSession {
    fn from(model: Model) -> Self {
        TunnelSession {
            id: model.id,
            user_id: model.user_id,
            team_id: model.team_id,
            current_url: model.current_url,
            local_port: u16::try_from(model.local_port).unwrap_or_default(),
            status: model.status.into(),
            privacy: model.privacy.into(),
            created_at: model.created_at,
            last_heartbeat: model.last_heartbeat,
        }
    }
}
