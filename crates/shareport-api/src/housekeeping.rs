//! Background jobs of the API server
//!
//! - Staleness sweep: sessions whose CLI stopped heartbeating (crash, lost
//!   network) are flipped to offline so dashboards stop showing them live.
//! - Retention: device requests older than the retention window are purged.

use chrono::{DateTime, Utc};
use shareport_core::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// How often both jobs run
    pub sweep_interval: Duration,
    /// Heartbeat age after which an online session is considered gone
    pub stale_after: Duration,
    /// Age after which device requests are deleted
    pub device_request_retention: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            device_request_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub marked_offline: usize,
    pub purged_requests: u64,
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Run both jobs once as of `now`
pub async fn sweep(
    store: &dyn SessionStore,
    config: &HousekeepingConfig,
    now: DateTime<Utc>,
) -> SweepReport {
    let mut report = SweepReport::default();

    match store
        .mark_stale_tunnels(cutoff(now, config.stale_after))
        .await
    {
        Ok(ids) => {
            for id in &ids {
                info!("Tunnel session {} stopped heartbeating, marked offline", id);
            }
            report.marked_offline = ids.len();
        }
        Err(e) => warn!("Staleness sweep failed: {}", e),
    }

    match store
        .purge_device_requests(cutoff(now, config.device_request_retention))
        .await
    {
        Ok(purged) => {
            if purged > 0 {
                debug!("Purged {} expired device requests", purged);
            }
            report.purged_requests = purged;
        }
        Err(e) => warn!("Device request retention failed: {}", e),
    }

    report
}

/// Handle to the running jobs
pub struct Housekeeping {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Housekeeping {
    pub fn spawn(store: Arc<dyn SessionStore>, config: HousekeepingConfig) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            info!(
                "🧹 Housekeeping every {:?} (stale after {:?})",
                config.sweep_interval, config.stale_after
            );
            let mut interval = tokio::time::interval(config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Housekeeping stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        sweep(store.as_ref(), &config, Utc::now()).await;
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Housekeeping task ended abnormally: {}", e);
        }
    }
}

impl Drop for Housekeeping {
    fn drop(&mut self) {
        self.task.abort();
    }
}
