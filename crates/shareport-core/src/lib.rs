//! Shareport core - device authorization and tunnel presence protocol
//!
//! A command-line client that cannot receive inbound connections learns about
//! approvals and session changes through a shared [`SessionStore`]:
//!
//! - [`DeviceAuthService`] issues device codes and mediates their approval
//! - [`DevicePoller`] drives the CLI side of the device-code handshake
//! - [`TunnelSessionManager`] owns one tunnel session and keeps it alive with heartbeats
//! - [`PresenceObserver`] keeps a dashboard view of sessions in sync with the store's change feed

pub mod device_auth;
pub mod device_poll;
pub mod model;
pub mod presence;
pub mod provider;
pub mod session;
pub mod store;
pub mod wire;

pub use device_auth::{generate_device_code, verification_url, DeviceAuthError, DeviceAuthService};
pub use device_poll::{DeviceGrant, DevicePoller, LoginError, PollConfig};
pub use model::{
    ChangeEvent, DeviceRequest, DeviceStatus, NewTunnelSession, Privacy, RowView, SessionScope,
    SessionStatus, TunnelSession, ANONYMOUS_USER_ID,
};
pub use presence::{PresenceObserver, PresenceView};
pub use provider::{ProviderError, ProviderTunnel, TunnelProvider};
pub use session::{
    ActiveSession, CloseReason, CloseReport, HeartbeatStats, OpenRequest, SessionConfig,
    SessionError, SessionMode, TunnelSessionManager,
};
pub use store::{
    ChangeBus, FeedEvent, MemoryStore, SessionStore, StoreError, Subscription, DEFAULT_DEVICE_CODE_TTL,
};
