//! Tunnel session lifecycle
//!
//! A [`TunnelSessionManager`] opens a provider tunnel, records it in the store
//! and hands back an [`ActiveSession`] that heartbeats the row until it is closed.
//! The store is optional for the tunnel's purposes: when it cannot be reached the
//! session runs in [`SessionMode::Offline`] with no dashboard visibility.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::{NewTunnelSession, Privacy, SessionStatus, TunnelSession};
use crate::provider::{ProviderError, ProviderTunnel, TunnelProvider};
use crate::store::{SessionStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to open tunnel: {0}")]
    Provider(#[from] ProviderError),
}

/// Heartbeat cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time between heartbeats; must stay well under the staleness threshold
    pub heartbeat_interval: Duration,
    /// Upper bound on any single store write made by the session
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }
}

/// What the user asked to share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub port: u16,
    pub privacy: Privacy,
    pub subdomain: Option<String>,
    pub team_slug: Option<String>,
    /// Owner; [`crate::ANONYMOUS_USER_ID`] when not logged in
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Recorded in the store and heartbeated
    Tracked,
    /// Store unreachable at open; the tunnel runs without dashboard visibility
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Interrupt,
    Terminate,
    /// The provider side went away
    TunnelLost,
    User,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Interrupt => "interrupt",
            CloseReason::Terminate => "terminate",
            CloseReason::TunnelLost => "tunnel lost",
            CloseReason::User => "user",
        })
    }
}

/// Outcome of the one close sequence a session ever runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    /// Reason given by the caller that triggered the close
    pub reason: CloseReason,
    /// Whether the store confirmed the row went offline
    pub marked_offline: bool,
}

/// Heartbeat counters
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
    last_success: StdMutex<Option<DateTime<Utc>>>,
}

impl HeartbeatStats {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Timestamp written by the latest successful heartbeat
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success.lock().ok().and_then(|guard| *guard)
    }

    fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self, at: DateTime<Utc>) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.lock() {
            *last = Some(at);
        }
    }

    /// Returns the length of the current failure streak
    fn record_failure(&self) -> u64 {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct TunnelSessionManager {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn TunnelProvider>,
    config: SessionConfig,
}

impl TunnelSessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn TunnelProvider>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Open a tunnel and start tracking it.
    ///
    /// Only provider failures are errors. An unknown team slug falls back to a
    /// personal session and an unreachable store to [`SessionMode::Offline`].
    pub async fn open(&self, request: OpenRequest) -> Result<Arc<ActiveSession>, SessionError> {
        let team_id = match &request.team_slug {
            Some(slug) => self.resolve_team(slug).await,
            None => None,
        };

        let tunnel = self
            .provider
            .open(request.port, request.subdomain.as_deref())
            .await?;
        info!(
            "Tunnel for port {} available at {}",
            request.port,
            tunnel.url()
        );

        let new_session = NewTunnelSession {
            user_id: request.user_id,
            team_id,
            current_url: tunnel.url().to_string(),
            local_port: request.port,
            privacy: request.privacy,
        };

        let (session, mode) = match self.store.insert_tunnel(new_session.clone()).await {
            Ok(session) => {
                info!("Recorded session {} ({})", session.id, session.privacy);
                (session, SessionMode::Tracked)
            }
            Err(e) => {
                warn!(
                    "Could not record session, running in offline mode without dashboard visibility: {}",
                    e
                );
                (
                    new_session.into_session(Uuid::new_v4(), Utc::now()),
                    SessionMode::Offline,
                )
            }
        };

        Ok(ActiveSession::start(
            session,
            mode,
            self.store.clone(),
            tunnel,
            self.config,
        ))
    }

    async fn resolve_team(&self, slug: &str) -> Option<Uuid> {
        match self.store.resolve_team(slug).await {
            Ok(Some(team_id)) => {
                debug!("Sharing with team {} ({})", slug, team_id);
                Some(team_id)
            }
            Ok(None) => {
                warn!("Team '{}' not found, sharing as a personal session", slug);
                None
            }
            Err(e) => {
                warn!(
                    "Could not resolve team '{}', sharing as a personal session: {}",
                    slug, e
                );
                None
            }
        }
    }
}

struct Heartbeat {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One open tunnel session, owned by the process that created it
pub struct ActiveSession {
    session: TunnelSession,
    mode: SessionMode,
    store: Arc<dyn SessionStore>,
    tunnel: Arc<dyn ProviderTunnel>,
    config: SessionConfig,
    stats: Arc<HeartbeatStats>,
    heartbeat: Mutex<Option<Heartbeat>>,
    /// Set as soon as a close sequence starts; the heartbeat never revives the row after this
    closing: Arc<AtomicBool>,
    report: OnceCell<CloseReport>,
    closed_tx: watch::Sender<bool>,
}

impl ActiveSession {
    fn start(
        session: TunnelSession,
        mode: SessionMode,
        store: Arc<dyn SessionStore>,
        tunnel: Arc<dyn ProviderTunnel>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let stats = Arc::new(HeartbeatStats::default());
        let closing = Arc::new(AtomicBool::new(false));

        let heartbeat = match mode {
            SessionMode::Tracked => {
                let (stop_tx, stop_rx) = oneshot::channel();
                let task = tokio::spawn(run_heartbeat(
                    store.clone(),
                    session.id,
                    config,
                    stats.clone(),
                    closing.clone(),
                    stop_rx,
                ));
                Some(Heartbeat { stop_tx, task })
            }
            SessionMode::Offline => None,
        };

        let (closed_tx, _) = watch::channel(false);

        Arc::new(Self {
            session,
            mode,
            store,
            tunnel,
            config,
            stats,
            heartbeat: Mutex::new(heartbeat),
            closing,
            report: OnceCell::new(),
            closed_tx,
        })
    }

    /// The session row as recorded at open
    pub fn session(&self) -> &TunnelSession {
        &self.session
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn url(&self) -> &str {
        self.tunnel.url()
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn stats(&self) -> &HeartbeatStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.report.initialized()
    }

    pub fn close_report(&self) -> Option<CloseReport> {
        self.report.get().cloned()
    }

    /// Run the close sequence.
    ///
    /// The sequence runs once per session no matter how many callers race here;
    /// every caller waits for it and receives the same report.
    pub async fn close(&self, reason: CloseReason) -> CloseReport {
        self.report
            .get_or_init(|| self.shutdown(reason))
            .await
            .clone()
    }

    /// Resolves once a close sequence has completed
    pub async fn wait_closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        let _ = closed.wait_for(|done| *done).await;
    }

    /// Resolves when the provider side of the tunnel goes away
    pub async fn tunnel_closed(&self) {
        self.tunnel.closed().await
    }

    async fn shutdown(&self, reason: CloseReason) -> CloseReport {
        info!("Closing session {} ({})", self.session.id, reason);
        self.closing.store(true, Ordering::SeqCst);

        // Stop heartbeating first so nothing can touch the row after it goes offline
        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            let _ = heartbeat.stop_tx.send(());
            if let Err(e) = heartbeat.task.await {
                if !e.is_cancelled() {
                    error!("Heartbeat task for {} panicked: {}", self.session.id, e);
                }
            }
        }

        let marked_offline = match self.mode {
            SessionMode::Tracked => self.mark_offline().await,
            SessionMode::Offline => false,
        };

        self.tunnel.close().await;
        self.closed_tx.send_replace(true);

        info!(
            "Session {} closed (marked offline: {})",
            self.session.id, marked_offline
        );
        CloseReport {
            reason,
            marked_offline,
        }
    }

    async fn mark_offline(&self) -> bool {
        let update = self
            .store
            .set_tunnel_status(self.session.id, SessionStatus::Offline);
        match timeout(self.config.heartbeat_timeout, update).await {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                warn!("Session {} no longer exists in the store", self.session.id);
                false
            }
            Ok(Err(e)) => {
                warn!("Failed to mark session {} offline: {}", self.session.id, e);
                false
            }
            Err(_) => {
                warn!(
                    "Timed out marking session {} offline after {:?}",
                    self.session.id, self.config.heartbeat_timeout
                );
                false
            }
        }
    }
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("id", &self.session.id)
            .field("url", &self.tunnel.url())
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Heartbeat loop. At most one beat is in flight; ticks missed while a beat is
/// slow are skipped rather than queued.
async fn run_heartbeat(
    store: Arc<dyn SessionStore>,
    session_id: Uuid,
    config: SessionConfig,
    stats: Arc<HeartbeatStats>,
    closing: Arc<AtomicBool>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let period = config.heartbeat_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!("Heartbeat for {} every {:?}", session_id, period);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            _ = &mut stop_rx => break,
            _ = beat(store.as_ref(), session_id, config.heartbeat_timeout, &stats, &closing) => {}
        }
    }

    debug!("Heartbeat for {} stopped", session_id);
}

async fn beat(
    store: &dyn SessionStore,
    session_id: Uuid,
    limit: Duration,
    stats: &HeartbeatStats,
    closing: &AtomicBool,
) {
    stats.record_attempt();
    let now = Utc::now();

    let write = async {
        if store.touch_tunnel(session_id, now).await? {
            return Ok(true);
        }
        // The row went offline under a live tunnel, e.g. swept during an outage
        if closing.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let revived = store.revive_tunnel(session_id, now).await?;
        if revived {
            info!("Session {} was marked offline while running, back online", session_id);
        }
        Ok::<bool, StoreError>(revived)
    };

    let failure = match timeout(limit, write).await {
        Ok(Ok(true)) => {
            stats.record_success(now);
            debug!("Heartbeat for {} at {}", session_id, now);
            return;
        }
        Ok(Ok(false)) => "session no longer exists".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", limit),
    };

    let streak = stats.record_failure();
    warn!(
        "Heartbeat for {} failed ({} in a row): {}",
        session_id, streak, failure
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ANONYMOUS_USER_ID;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct FakeTunnel {
        url: String,
        closed: AtomicBool,
        notify: Notify,
    }

    #[async_trait]
    impl ProviderTunnel for FakeTunnel {
        fn url(&self) -> &str {
            &self.url
        }

        async fn closed(&self) {
            loop {
                let notified = self.notify.notified();
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        fail: bool,
    }

    #[async_trait]
    impl TunnelProvider for FakeProvider {
        async fn open(
            &self,
            _port: u16,
            subdomain: Option<&str>,
        ) -> Result<Arc<dyn ProviderTunnel>, ProviderError> {
            if self.fail {
                return Err(ProviderError::Rejected("no capacity".to_string()));
            }
            Ok(Arc::new(FakeTunnel {
                url: format!("https://{}.loca.lt", subdomain.unwrap_or("tidy-yak")),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }))
        }
    }

    fn request(team_slug: Option<&str>) -> OpenRequest {
        OpenRequest {
            port: 3000,
            privacy: Privacy::Private,
            subdomain: None,
            team_slug: team_slug.map(str::to_string),
            user_id: ANONYMOUS_USER_ID,
        }
    }

    fn manager(store: Arc<MemoryStore>, provider: FakeProvider) -> TunnelSessionManager {
        TunnelSessionManager::new(store, Arc::new(provider), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_open_records_online_session() {
        let store = Arc::new(MemoryStore::new());
        let session = manager(store.clone(), FakeProvider::default())
            .open(request(None))
            .await
            .unwrap();

        assert_eq!(session.mode(), SessionMode::Tracked);
        let row = store.find_tunnel(session.id()).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Online);
        assert_eq!(row.privacy, Privacy::Private);
        assert_eq!(row.current_url, "https://tidy-yak.loca.lt");
        assert_eq!(row.last_heartbeat, row.created_at);
    }

    #[tokio::test]
    async fn test_unknown_team_falls_back_to_personal() {
        let store = Arc::new(MemoryStore::new());
        let session = manager(store.clone(), FakeProvider::default())
            .open(request(Some("ghosts")))
            .await
            .unwrap();

        assert_eq!(session.session().team_id, None);
    }

    #[tokio::test]
    async fn test_known_team_is_attached() {
        let store = Arc::new(MemoryStore::new());
        let team = store.add_team("platform");
        let session = manager(store.clone(), FakeProvider::default())
            .open(request(Some("platform")))
            .await
            .unwrap();

        assert_eq!(session.session().team_id, Some(team));
    }

    #[tokio::test]
    async fn test_provider_error_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let result = manager(store.clone(), FakeProvider { fail: true })
            .open(request(None))
            .await;

        assert!(matches!(result, Err(SessionError::Provider(_))));
        assert!(store
            .list_tunnels(&crate::model::SessionScope::Owner(ANONYMOUS_USER_ID))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_opens_offline_mode() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);

        let session = manager(store.clone(), FakeProvider::default())
            .open(request(Some("platform")))
            .await
            .unwrap();
        assert_eq!(session.mode(), SessionMode::Offline);
        assert_eq!(session.url(), "https://tidy-yak.loca.lt");

        let report = session.close(CloseReason::User).await;
        assert!(!report.marked_offline);
    }

    #[tokio::test]
    async fn test_close_marks_offline_and_blocks_heartbeats() {
        let store = Arc::new(MemoryStore::new());
        let session = manager(store.clone(), FakeProvider::default())
            .open(request(None))
            .await
            .unwrap();

        let report = session.close(CloseReason::Interrupt).await;
        assert!(report.marked_offline);
        assert!(session.is_closed());

        // A stray late heartbeat cannot bring it back
        assert!(!store.touch_tunnel(session.id(), Utc::now()).await.unwrap());
        let row = store.find_tunnel(session.id()).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Offline);
    }

    #[tokio::test]
    async fn test_concurrent_close_runs_once() {
        let store = Arc::new(MemoryStore::new());
        let session = manager(store.clone(), FakeProvider::default())
            .open(request(None))
            .await
            .unwrap();

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.close(CloseReason::Interrupt).await })
        };
        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.close(CloseReason::Terminate).await })
        };

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(first, second);
        assert!(first.marked_offline);
    }

    #[tokio::test]
    async fn test_wait_closed_resolves_after_close() {
        let store = Arc::new(MemoryStore::new());
        let session = manager(store, FakeProvider::default())
            .open(request(None))
            .await
            .unwrap();

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_closed().await })
        };

        session.close(CloseReason::User).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_closed did not resolve")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), session.tunnel_closed())
            .await
            .expect("tunnel was not closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_survives_outage_without_backlog() {
        let store = Arc::new(MemoryStore::new());
        let session = manager(store.clone(), FakeProvider::default())
            .open(request(None))
            .await
            .unwrap();

        // Beats at 10s, 20s and 30s hit the outage
        store.set_available(false);
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(session.stats().failures(), 3);
        assert_eq!(session.stats().consecutive_failures(), 3);
        assert!(!session.is_closed());

        store.set_available(true);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let stats = session.stats();
        assert_eq!(stats.attempts(), 4);
        assert_eq!(stats.successes(), 1);
        assert_eq!(stats.consecutive_failures(), 0);

        let row = store.find_tunnel(session.id()).await.unwrap().unwrap();
        assert_eq!(Some(row.last_heartbeat), stats.last_success());
        assert_eq!(row.status, SessionStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_revives_row_swept_during_outage() {
        let store = Arc::new(MemoryStore::new());
        let session = manager(store.clone(), FakeProvider::default())
            .open(request(None))
            .await
            .unwrap();

        store.set_available(false);
        tokio::time::sleep(Duration::from_secs(65)).await;
        store.set_available(true);

        // The staleness sweep runs before the next beat gets through
        let swept = store
            .mark_stale_tunnels(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(swept, vec![session.id()]);

        tokio::time::sleep(Duration::from_secs(10)).await;

        let row = store.find_tunnel(session.id()).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Online);
        assert_eq!(session.stats().successes(), 1);
        assert_eq!(session.stats().consecutive_failures(), 0);

        // Once closed, nothing brings it back
        session.close(CloseReason::User).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        let row = store.find_tunnel(session.id()).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Offline);
    }
}
