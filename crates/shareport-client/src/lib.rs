//! Network side of the shareport CLI
//!
//! - [`HttpStore`]: the [`shareport_core::SessionStore`] contract over the store REST API,
//!   including the server-sent change feed
//! - [`LocaltunnelProvider`]: public endpoints from a localtunnel-compatible server

pub mod http_store;
pub mod provider;
mod sse;

pub use http_store::HttpStore;
pub use provider::{LocaltunnelProvider, LocaltunnelTunnel};
