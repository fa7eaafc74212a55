//! [`SessionStore`] over sea-orm
//!
//! Row transitions are single conditional `UPDATE`s so the database decides the
//! winner of concurrent writers. Change events are published on an in-process
//! [`ChangeBus`] after each successful write; the relay process is the only
//! writer to these tables, so its bus sees every change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, SqlErr,
};
use shareport_core::model::{
    ChangeEvent, DeviceRequest, DeviceStatus, NewTunnelSession, SessionScope, SessionStatus,
    TunnelSession,
};
use shareport_core::store::{
    ChangeBus, SessionStore, StoreError, Subscription, DEFAULT_DEVICE_CODE_TTL,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::device_request::{self, DeviceRequestStatus};
use crate::entities::team_member::{self, TeamRole};
use crate::entities::tunnel::{self, TunnelPrivacy, TunnelStatus};
use crate::entities::{team, user};

fn store_err(err: DbErr) -> StoreError {
    if let Some(SqlErr::UniqueConstraintViolation(detail)) = err.sql_err() {
        return StoreError::Conflict(detail);
    }
    match err {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => StoreError::Unavailable(err.to_string()),
        DbErr::RecordNotFound(detail) => StoreError::NotFound(detail),
        other => StoreError::Backend(other.to_string()),
    }
}

#[derive(Clone)]
pub struct DbStore {
    db: DatabaseConnection,
    device_code_ttl: chrono::Duration,
    bus: ChangeBus,
}

impl DbStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            device_code_ttl: chrono::Duration::seconds(DEFAULT_DEVICE_CODE_TTL.as_secs() as i64),
            bus: ChangeBus::new(),
        }
    }

    pub fn with_device_code_ttl(mut self, ttl: std::time::Duration) -> Self {
        if let Ok(ttl) = chrono::Duration::from_std(ttl) {
            self.device_code_ttl = ttl;
        }
        self
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn change_bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub async fn find_user(&self, id: Uuid) -> Result<Option<user::Model>, StoreError> {
        user::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(store_err)
    }

    pub async fn create_user(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<user::Model, StoreError> {
        let user = user::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(email.to_string()),
            display_name: Set(display_name.map(str::to_string)),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await
        .map_err(store_err)?;

        info!("Created user {} ({})", user.id, user.email);
        Ok(user)
    }

    pub async fn find_team(&self, slug: &str) -> Result<Option<team::Model>, StoreError> {
        team::Entity::find()
            .filter(team::Column::Slug.eq(slug))
            .one(&self.db)
            .await
            .map_err(store_err)
    }

    /// Create a team with `owner_id` as its first member
    pub async fn create_team(
        &self,
        name: &str,
        slug: &str,
        owner_id: Uuid,
    ) -> Result<team::Model, StoreError> {
        let team = team::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            slug: Set(slug.to_string()),
            owner_id: Set(owner_id),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await
        .map_err(store_err)?;

        self.add_team_member(team.id, owner_id, TeamRole::Owner)
            .await?;

        info!("Created team {} ({})", team.slug, team.id);
        Ok(team)
    }

    pub async fn add_team_member(
        &self,
        team_id: Uuid,
        user_id: Uuid,
        role: TeamRole,
    ) -> Result<(), StoreError> {
        team_member::ActiveModel {
            team_id: Set(team_id),
            user_id: Set(user_id),
            role: Set(role),
            joined_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    pub async fn is_team_member(&self, team_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let membership = team_member::Entity::find_by_id((team_id, user_id))
            .one(&self.db)
            .await
            .map_err(store_err)?;
        Ok(membership.is_some())
    }

    async fn find_tunnel_model(&self, id: Uuid) -> Result<Option<tunnel::Model>, StoreError> {
        tunnel::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(store_err)
    }

    /// Publish the update of a row whose previous state was `old`.
    ///
    /// The new state is `old` with the committed columns applied, so publishing
    /// never needs another round trip after the write.
    fn publish_update<F>(&self, old: tunnel::Model, apply: F)
    where
        F: FnOnce(&mut tunnel::Model),
    {
        let mut record = old.clone();
        apply(&mut record);
        self.bus.publish(ChangeEvent::Update {
            record: record.into(),
            old: old.into(),
        });
    }

    /// Insert a session that can only be written by holders of `write_key`
    pub async fn register_tunnel(
        &self,
        session: NewTunnelSession,
        write_key: &str,
    ) -> Result<TunnelSession, StoreError> {
        self.insert_tunnel_model(session, Some(write_key.to_string()))
            .await
    }

    /// Whether `key` is the write key issued for session `id`.
    /// Sessions inserted without a key accept none.
    pub async fn check_write_key(&self, id: Uuid, key: &str) -> Result<bool, StoreError> {
        let model = self.find_tunnel_model(id).await?;
        Ok(matches!(
            model.and_then(|m| m.write_key),
            Some(expected) if expected == key
        ))
    }

    async fn insert_tunnel_model(
        &self,
        session: NewTunnelSession,
        write_key: Option<String>,
    ) -> Result<TunnelSession, StoreError> {
        let now = Utc::now();
        let model = tunnel::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(session.user_id),
            team_id: Set(session.team_id),
            current_url: Set(session.current_url),
            local_port: Set(i32::from(session.local_port)),
            status: Set(TunnelStatus::Online),
            privacy: Set(TunnelPrivacy::from(session.privacy)),
            created_at: Set(now),
            last_heartbeat: Set(now),
            write_key: Set(write_key),
        }
        .insert(&self.db)
        .await
        .map_err(store_err)?;

        let record: TunnelSession = model.into();
        self.bus.publish(ChangeEvent::Insert {
            record: record.clone(),
        });
        Ok(record)
    }
}

#[async_trait]
impl SessionStore for DbStore {
    async fn insert_device_request(&self, device_code: &str) -> Result<DeviceRequest, StoreError> {
        let now = Utc::now();
        let model = device_request::ActiveModel {
            device_code: Set(device_code.to_string()),
            status: Set(DeviceRequestStatus::Pending),
            user_id: Set(None),
            created_at: Set(now),
            expires_at: Set(now + self.device_code_ttl),
        }
        .insert(&self.db)
        .await
        .map_err(store_err)?;

        Ok(model.into())
    }

    async fn find_device_request(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceRequest>, StoreError> {
        let model = device_request::Entity::find_by_id(device_code.to_string())
            .one(&self.db)
            .await
            .map_err(store_err)?;
        Ok(model.map(Into::into))
    }

    async fn transition_device_request(
        &self,
        device_code: &str,
        from: DeviceStatus,
        to: DeviceStatus,
        user_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let mut update = device_request::Entity::update_many()
            .col_expr(
                device_request::Column::Status,
                Expr::value(DeviceRequestStatus::from(to)),
            )
            .filter(device_request::Column::DeviceCode.eq(device_code))
            .filter(device_request::Column::Status.eq(DeviceRequestStatus::from(from)));

        if let Some(user_id) = user_id {
            update = update.col_expr(device_request::Column::UserId, Expr::value(user_id));
        }

        let result = update.exec(&self.db).await.map_err(store_err)?;
        debug!(
            "Device request {} {} -> {}: {} row(s)",
            device_code, from, to, result.rows_affected
        );
        Ok(result.rows_affected == 1)
    }

    async fn purge_device_requests(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = device_request::Entity::delete_many()
            .filter(device_request::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected)
    }

    async fn insert_tunnel(&self, session: NewTunnelSession) -> Result<TunnelSession, StoreError> {
        self.insert_tunnel_model(session, None).await
    }

    async fn find_tunnel(&self, id: Uuid) -> Result<Option<TunnelSession>, StoreError> {
        Ok(self.find_tunnel_model(id).await?.map(Into::into))
    }

    async fn touch_tunnel(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(old) = self.find_tunnel_model(id).await? else {
            return Ok(false);
        };

        let result = tunnel::Entity::update_many()
            .col_expr(tunnel::Column::LastHeartbeat, Expr::value(at))
            .filter(tunnel::Column::Id.eq(id))
            .filter(tunnel::Column::Status.eq(TunnelStatus::Online))
            .exec(&self.db)
            .await
            .map_err(store_err)?;

        if result.rows_affected == 0 {
            return Ok(false);
        }
        self.publish_update(old, |row| row.last_heartbeat = at);
        Ok(true)
    }

    async fn revive_tunnel(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(old) = self.find_tunnel_model(id).await? else {
            return Ok(false);
        };

        let result = tunnel::Entity::update_many()
            .col_expr(tunnel::Column::Status, Expr::value(TunnelStatus::Online))
            .col_expr(tunnel::Column::LastHeartbeat, Expr::value(at))
            .filter(tunnel::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(store_err)?;

        if result.rows_affected == 0 {
            return Ok(false);
        }
        if old.status == TunnelStatus::Offline {
            info!("Tunnel session {} revived by its owner", id);
        }
        self.publish_update(old, |row| {
            row.status = TunnelStatus::Online;
            row.last_heartbeat = at;
        });
        Ok(true)
    }

    async fn set_tunnel_status(&self, id: Uuid, status: SessionStatus) -> Result<bool, StoreError> {
        let Some(old) = self.find_tunnel_model(id).await? else {
            return Ok(false);
        };

        let result = tunnel::Entity::update_many()
            .col_expr(tunnel::Column::Status, Expr::value(TunnelStatus::from(status)))
            .filter(tunnel::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(store_err)?;

        if result.rows_affected == 0 {
            return Ok(false);
        }
        self.publish_update(old, |row| row.status = TunnelStatus::from(status));
        Ok(true)
    }

    async fn delete_tunnel(&self, id: Uuid) -> Result<bool, StoreError> {
        let Some(old) = self.find_tunnel_model(id).await? else {
            return Ok(false);
        };

        let result = tunnel::Entity::delete_by_id(id)
            .exec(&self.db)
            .await
            .map_err(store_err)?;

        if result.rows_affected == 0 {
            return Ok(false);
        }
        self.bus.publish(ChangeEvent::Delete { old: old.into() });
        Ok(true)
    }

    async fn list_tunnels(&self, scope: &SessionScope) -> Result<Vec<TunnelSession>, StoreError> {
        let query = match scope {
            SessionScope::Owner(user_id) => {
                tunnel::Entity::find().filter(tunnel::Column::UserId.eq(*user_id))
            }
            SessionScope::Team(team_id) => {
                tunnel::Entity::find().filter(tunnel::Column::TeamId.eq(*team_id))
            }
            SessionScope::Community => tunnel::Entity::find()
                .filter(tunnel::Column::Status.eq(TunnelStatus::Online))
                .filter(tunnel::Column::Privacy.eq(TunnelPrivacy::Public)),
        };

        let models = query
            .order_by_desc(tunnel::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(store_err)?;
        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn mark_stale_tunnels(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let stale = tunnel::Entity::find()
            .filter(tunnel::Column::Status.eq(TunnelStatus::Online))
            .filter(tunnel::Column::LastHeartbeat.lt(cutoff))
            .all(&self.db)
            .await
            .map_err(store_err)?;

        let mut marked = Vec::with_capacity(stale.len());
        for old in stale {
            // Re-check in the UPDATE so a heartbeat that just landed wins
            let result = tunnel::Entity::update_many()
                .col_expr(tunnel::Column::Status, Expr::value(TunnelStatus::Offline))
                .filter(tunnel::Column::Id.eq(old.id))
                .filter(tunnel::Column::Status.eq(TunnelStatus::Online))
                .filter(tunnel::Column::LastHeartbeat.lt(cutoff))
                .exec(&self.db)
                .await
                .map_err(store_err)?;

            if result.rows_affected == 1 {
                marked.push(old.id);
                self.publish_update(old, |row| row.status = TunnelStatus::Offline);
            }
        }
        Ok(marked)
    }

    async fn resolve_team(&self, slug: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.find_team(slug).await?.map(|team| team.id))
    }

    async fn subscribe(&self, scope: SessionScope) -> Result<Subscription, StoreError> {
        Ok(self.bus.subscribe(scope))
    }
}
