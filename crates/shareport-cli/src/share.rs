//! `shareport share`
//!
//! Opens the tunnel (retrying provider failures), then idles until a signal or
//! the provider ends the tunnel, and closes the session exactly once.

use shareport_core::{
    ActiveSession, CloseReason, CloseReport, OpenRequest, SessionError, SessionMode,
    TunnelSessionManager,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RETRY_MAX)
}

/// Resolves on the first SIGINT or SIGTERM
pub async fn shutdown_signal() -> CloseReason {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => CloseReason::Interrupt,
                    _ = terminate.recv() => CloseReason::Terminate,
                }
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                CloseReason::Interrupt
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        CloseReason::Interrupt
    }
}

/// Open the session, retrying provider errors with capped exponential backoff.
///
/// Returns `None` if `shutdown` fires before a tunnel could be opened.
pub async fn open_with_retry<S>(
    manager: &TunnelSessionManager,
    request: &OpenRequest,
    shutdown: &mut S,
) -> Option<Arc<ActiveSession>>
where
    S: Future<Output = CloseReason> + Unpin,
{
    let mut backoff = RETRY_INITIAL;

    loop {
        let result = tokio::select! {
            reason = &mut *shutdown => {
                info!("{} before the tunnel opened", reason);
                return None;
            }
            result = manager.open(request.clone()) => result,
        };

        match result {
            Ok(session) => return Some(session),
            Err(SessionError::Provider(e)) => {
                warn!(
                    "❌ Could not open tunnel for port {}: {} (retrying in {}s)",
                    request.port,
                    e,
                    backoff.as_secs()
                );
            }
        }

        tokio::select! {
            reason = &mut *shutdown => {
                info!("{} while waiting to retry", reason);
                return None;
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff);
    }
}

/// Run a share until `shutdown` or tunnel loss; `None` if it never opened
pub async fn share<S>(
    manager: &TunnelSessionManager,
    request: OpenRequest,
    shutdown: S,
) -> Option<CloseReport>
where
    S: Future<Output = CloseReason>,
{
    tokio::pin!(shutdown);
    let session = open_with_retry(manager, &request, &mut shutdown).await?;

    println!();
    println!("✅ Sharing http://localhost:{}", request.port);
    println!("   Public URL: {}", session.url());
    if session.mode() == SessionMode::Offline {
        println!("   ⚠️  Presence store unreachable: this session is not visible on dashboards");
    }
    println!("   Press Ctrl+C to stop");
    println!();

    let reason = tokio::select! {
        reason = &mut shutdown => reason,
        _ = session.tunnel_closed() => CloseReason::TunnelLost,
    };

    let report = session.close(reason).await;
    info!(
        "Session {} closed ({}), marked offline: {}",
        session.id(),
        report.reason,
        report.marked_offline
    );
    println!("👋 Stopped sharing port {}", request.port);
    Some(report)
}
