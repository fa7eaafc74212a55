//! DeviceRequest entity backing the device-code login flow

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use shareport_core::model::{DeviceRequest, DeviceStatus};

/// Stored device request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum DeviceRequestStatus {
    #[sea_orm(string_value = "pending")]
    Pending,

    #[sea_orm(string_value = "approved")]
    Approved,

    #[sea_orm(string_value = "expired")]
    Expired,
}

impl From<DeviceStatus> for DeviceRequestStatus {
    fn from(status: DeviceStatus) -> Self {
        match status {
            DeviceStatus::Pending => DeviceRequestStatus::Pending,
            DeviceStatus::Approved => DeviceRequestStatus::Approved,
            DeviceStatus::Expired => DeviceRequestStatus::Expired,
        }
    }
}

impl From<DeviceRequestStatus> for DeviceStatus {
    fn from(status: DeviceRequestStatus) -> Self {
        match status {
            DeviceRequestStatus::Pending => DeviceStatus::Pending,
            DeviceRequestStatus::Approved => DeviceStatus::Approved,
            DeviceRequestStatus::Expired => DeviceStatus::Expired,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device_requests")]
pub struct Model {
    /// Device code (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub device_code: String,

    pub status: DeviceRequestStatus,

    /// Approving user, set only together with `approved`
    pub user_id: Option<Uuid>,

    /// When the code was issued
    pub created_at: ChronoDateTimeUtc,

    /// After this instant a pending request reads as expired
    pub expires_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for DeviceRequest {
    fn from(model: Model) -> Self {
        DeviceRequest {
            device_code: model.device_code,
            status: model.status.into(),
            user_id: model.user_id,
            created_at: model.created_at,
            expires_at: model.expires_at,
        }
    }
}
