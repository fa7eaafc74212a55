//! Session store abstraction
//!
//! The store is the only shared mutable resource in the system. Every component
//! receives an `Arc<dyn SessionStore>` in its constructor so tests can swap in
//! [`MemoryStore`] while the CLI talks to the network API and the server to the database.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{
    ChangeEvent, DeviceRequest, DeviceStatus, NewTunnelSession, SessionScope, SessionStatus,
    TunnelSession,
};

/// How long a device code stays approvable after it was issued
pub const DEFAULT_DEVICE_CODE_TTL: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Per-subscriber buffer between the change bus and the consumer
const SUBSCRIPTION_BUFFER: usize = 64;

/// Capacity of the broadcast channel behind a [`ChangeBus`]
const CHANGE_BUS_CAPACITY: usize = 256;

/// Store errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Table operations the protocol needs from the store
///
/// Mutations are atomic per row. `transition_device_request`, `touch_tunnel` and
/// `set_tunnel_status` report whether they actually changed a row so callers can
/// tell a lost race from a success.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a pending request; the store assigns `created_at` and `expires_at`.
    /// Fails with [`StoreError::Conflict`] if the code is already taken.
    async fn insert_device_request(&self, device_code: &str) -> Result<DeviceRequest, StoreError>;

    async fn find_device_request(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceRequest>, StoreError>;

    /// Compare-and-set on `status`. Sets `user_id` together with the new status.
    async fn transition_device_request(
        &self,
        device_code: &str,
        from: DeviceStatus,
        to: DeviceStatus,
        user_id: Option<Uuid>,
    ) -> Result<bool, StoreError>;

    /// Delete requests created before `cutoff`; returns how many were removed
    async fn purge_device_requests(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Insert an online session; the store assigns `id`, `created_at` and the
    /// first heartbeat.
    async fn insert_tunnel(&self, session: NewTunnelSession) -> Result<TunnelSession, StoreError>;

    async fn find_tunnel(&self, id: Uuid) -> Result<Option<TunnelSession>, StoreError>;

    /// Record a heartbeat. Only rows that are still online are touched.
    async fn touch_tunnel(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Heartbeat that also sets the row back to online. Used by the owning
    /// process when its row was swept offline while the tunnel kept running.
    async fn revive_tunnel(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn set_tunnel_status(&self, id: Uuid, status: SessionStatus) -> Result<bool, StoreError>;

    async fn delete_tunnel(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Sessions visible under `scope`, newest first
    async fn list_tunnels(&self, scope: &SessionScope) -> Result<Vec<TunnelSession>, StoreError>;

    /// Flip online sessions whose last heartbeat is older than `cutoff` to offline
    async fn mark_stale_tunnels(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    /// Resolve a team slug to its id
    async fn resolve_team(&self, slug: &str) -> Result<Option<Uuid>, StoreError>;

    /// Open a change feed for `scope`
    async fn subscribe(&self, scope: SessionScope) -> Result<Subscription, StoreError>;
}

/// Item delivered by a [`Subscription`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Change(ChangeEvent),
    /// The feed dropped events; consumers must resynchronize from a fresh read
    Lagged(u64),
}

/// Live change feed handle
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`]) stops the
/// listener task feeding it.
pub struct Subscription {
    scope: SessionScope,
    events: mpsc::Receiver<FeedEvent>,
    listener: JoinHandle<()>,
}

impl Subscription {
    /// Wrap a listener task that forwards events into `events`
    pub fn new(
        scope: SessionScope,
        events: mpsc::Receiver<FeedEvent>,
        listener: JoinHandle<()>,
    ) -> Self {
        Self {
            scope,
            events,
            listener,
        }
    }

    /// Create the channel pair a listener task writes into
    pub fn channel() -> (mpsc::Sender<FeedEvent>, mpsc::Receiver<FeedEvent>) {
        mpsc::channel(SUBSCRIPTION_BUFFER)
    }

    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    /// Next event, or `None` once the listener has stopped
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn is_active(&self) -> bool {
        !self.listener.is_finished()
    }

    pub fn unsubscribe(self) {
        debug!("Unsubscribing from {}", self.scope);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("scope", &self.scope)
            .field("active", &self.is_active())
            .finish()
    }
}

/// In-process fan-out of table changes to scoped subscribers
///
/// Used by the in-memory and database stores; each subscriber gets a bridge task
/// that filters the broadcast by scope.
#[derive(Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No receivers is the common case for a CLI-side store
        let _ = self.sender.send(event);
    }

    /// Number of live subscriber bridges
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn subscribe(&self, scope: SessionScope) -> Subscription {
        let mut changes = self.sender.subscribe();
        let (tx, rx) = Subscription::channel();

        let listener = tokio::spawn(async move {
            loop {
                let item = match changes.recv().await {
                    Ok(event) if event.concerns(&scope) => FeedEvent::Change(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Change feed for {} lagged by {} events", scope, skipped);
                        FeedEvent::Lagged(skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        Subscription::new(scope, rx, listener)
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
