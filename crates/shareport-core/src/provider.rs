//! Tunnel provider abstraction
//!
//! The data plane belongs to a third-party provider. The core only needs the
//! public URL it hands back and a way to notice or force the tunnel closing.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Provider errors. All of them are fatal to the invocation that opened the tunnel.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider request failed: {0}")]
    Request(String),

    #[error("Provider rejected the tunnel: {0}")]
    Rejected(String),

    #[error("Provider I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens public endpoints that forward to a local port
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a public endpoint for `port`, optionally asking for `subdomain`
    async fn open(
        &self,
        port: u16,
        subdomain: Option<&str>,
    ) -> Result<Arc<dyn ProviderTunnel>, ProviderError>;
}

/// A live provider tunnel
#[async_trait]
pub trait ProviderTunnel: Send + Sync {
    /// Externally reachable address
    fn url(&self) -> &str;

    /// Resolves once the provider side has gone away
    async fn closed(&self);

    /// Tear the tunnel down. Calling it again is a no-op.
    async fn close(&self);
}
