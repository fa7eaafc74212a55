//! In-process store
//!
//! Implements the full [`SessionStore`] contract over hash maps. Outages can be
//! simulated with [`MemoryStore::set_available`], which makes every call fail with
//! [`StoreError::Unavailable`] until the store is marked available again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{ChangeBus, SessionStore, StoreError, Subscription, DEFAULT_DEVICE_CODE_TTL};
use crate::model::{
    ChangeEvent, DeviceRequest, DeviceStatus, NewTunnelSession, SessionScope, SessionStatus,
    TunnelSession,
};

#[derive(Default)]
struct Tables {
    device_requests: HashMap<String, DeviceRequest>,
    tunnels: HashMap<Uuid, TunnelSession>,
    teams: HashMap<String, Uuid>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    available: AtomicBool,
    device_code_ttl: chrono::Duration,
    bus: ChangeBus,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_device_code_ttl(DEFAULT_DEVICE_CODE_TTL)
    }

    pub fn with_device_code_ttl(ttl: std::time::Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
            device_code_ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            bus: ChangeBus::new(),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Register a team so its slug resolves
    pub fn add_team(&self, slug: &str) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut tables) = self.tables.lock() {
            tables.teams.insert(slug.to_string(), id);
        }
        id
    }

    pub fn change_bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Codes of requests still waiting for approval, oldest first
    pub fn pending_codes(&self) -> Vec<String> {
        let Ok(tables) = self.tables.lock() else {
            return Vec::new();
        };
        let mut pending: Vec<&DeviceRequest> = tables
            .device_requests
            .values()
            .filter(|r| r.status == DeviceStatus::Pending)
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.into_iter().map(|r| r.device_code.clone()).collect()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store is offline".to_string(),
            ));
        }
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    /// Apply `mutate` to a tunnel row and publish the resulting update
    fn update_tunnel<F>(&self, id: Uuid, mutate: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut TunnelSession) -> bool,
    {
        let event = {
            let mut tables = self.tables()?;
            let Some(row) = tables.tunnels.get_mut(&id) else {
                return Ok(false);
            };
            let old = row.clone();
            if !mutate(row) {
                return Ok(false);
            }
            ChangeEvent::Update {
                record: row.clone(),
                old,
            }
        };
        self.bus.publish(event);
        Ok(true)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_device_request(&self, device_code: &str) -> Result<DeviceRequest, StoreError> {
        let mut tables = self.tables()?;
        if tables.device_requests.contains_key(device_code) {
            return Err(StoreError::Conflict(format!(
                "device code '{}' already exists",
                device_code
            )));
        }

        let now = Utc::now();
        let request = DeviceRequest {
            device_code: device_code.to_string(),
            status: DeviceStatus::Pending,
            user_id: None,
            created_at: now,
            expires_at: now + self.device_code_ttl,
        };
        tables
            .device_requests
            .insert(device_code.to_string(), request.clone());
        Ok(request)
    }

    async fn find_device_request(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceRequest>, StoreError> {
        Ok(self.tables()?.device_requests.get(device_code).cloned())
    }

    async fn transition_device_request(
        &self,
        device_code: &str,
        from: DeviceStatus,
        to: DeviceStatus,
        user_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        match tables.device_requests.get_mut(device_code) {
            Some(row) if row.status == from => {
                row.status = to;
                if user_id.is_some() {
                    row.user_id = user_id;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_device_requests(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables()?;
        let before = tables.device_requests.len();
        tables.device_requests.retain(|_, r| r.created_at >= cutoff);
        Ok((before - tables.device_requests.len()) as u64)
    }

    async fn insert_tunnel(&self, session: NewTunnelSession) -> Result<TunnelSession, StoreError> {
        let record = session.into_session(Uuid::new_v4(), Utc::now());
        self.tables()?.tunnels.insert(record.id, record.clone());
        self.bus.publish(ChangeEvent::Insert {
            record: record.clone(),
        });
        Ok(record)
    }

    async fn find_tunnel(&self, id: Uuid) -> Result<Option<TunnelSession>, StoreError> {
        Ok(self.tables()?.tunnels.get(&id).cloned())
    }

    async fn touch_tunnel(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update_tunnel(id, |row| {
            if row.status != SessionStatus::Online {
                return false;
            }
            row.last_heartbeat = at;
            true
        })
    }

    async fn revive_tunnel(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update_tunnel(id, |row| {
            row.status = SessionStatus::Online;
            row.last_heartbeat = at;
            true
        })
    }

    async fn set_tunnel_status(&self, id: Uuid, status: SessionStatus) -> Result<bool, StoreError> {
        self.update_tunnel(id, |row| {
            row.status = status;
            true
        })
    }

    async fn delete_tunnel(&self, id: Uuid) -> Result<bool, StoreError> {
        let removed = self.tables()?.tunnels.remove(&id);
        match removed {
            Some(old) => {
                self.bus.publish(ChangeEvent::Delete { old });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_tunnels(&self, scope: &SessionScope) -> Result<Vec<TunnelSession>, StoreError> {
        let tables = self.tables()?;
        let mut sessions: Vec<TunnelSession> = tables
            .tunnels
            .values()
            .filter(|s| scope.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn mark_stale_tunnels(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let stale: Vec<Uuid> = self
            .tables()?
            .tunnels
            .values()
            .filter(|s| s.status == SessionStatus::Online && s.last_heartbeat < cutoff)
            .map(|s| s.id)
            .collect();

        let mut marked = Vec::with_capacity(stale.len());
        for id in stale {
            let flipped = self.update_tunnel(id, |row| {
                if row.status != SessionStatus::Online || row.last_heartbeat >= cutoff {
                    return false;
                }
                row.status = SessionStatus::Offline;
                true
            })?;
            if flipped {
                marked.push(id);
            }
        }
        Ok(marked)
    }

    async fn resolve_team(&self, slug: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.tables()?.teams.get(slug).copied())
    }

    async fn subscribe(&self, scope: SessionScope) -> Result<Subscription, StoreError> {
        // Fail like any other call while "offline"
        drop(self.tables()?);
        Ok(self.bus.subscribe(scope))
    }
}
