//! `shareport watch`: a terminal dashboard over the presence feed

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use shareport_core::{PresenceObserver, SessionScope, SessionStore, TunnelSession};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

/// Session table as printed by `watch`
pub fn render_table(scope: &SessionScope, sessions: &[TunnelSession], now: DateTime<Utc>) -> String {
    let mut out = format!("Sessions ({}): {}\n", scope, sessions.len());
    if sessions.is_empty() {
        out.push_str("  (none)\n");
        return out;
    }

    out.push_str(&format!(
        "  {:<8} {:<7} {:<7} {:<6} {:<10} {}\n",
        "ID", "STATUS", "PRIVACY", "PORT", "HEARTBEAT", "URL"
    ));
    for session in sessions {
        let id = session.id.simple().to_string();
        out.push_str(&format!(
            "  {:<8} {:<7} {:<7} {:<6} {:<10} {}\n",
            &id[..8],
            session.status.as_str(),
            session.privacy.as_str(),
            session.local_port,
            age(session.last_heartbeat, now),
            session.current_url
        ));
    }
    out
}

/// Print the table for `scope` and reprint it on every change until `shutdown`
pub async fn watch<S>(store: Arc<dyn SessionStore>, scope: SessionScope, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    let observer = PresenceObserver::subscribe(store, scope).await?;
    let mut updates = observer.updates();
    tokio::pin!(shutdown);

    loop {
        let sessions = observer.snapshot().await;
        println!("{}", render_table(&scope, &sessions, Utc::now()));

        tokio::select! {
            _ = &mut shutdown => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    bail!("Change feed for {} ended", scope);
                }
            }
        }
    }

    info!("Stopped watching {}", scope);
    observer.unsubscribe();
    Ok(())
}
