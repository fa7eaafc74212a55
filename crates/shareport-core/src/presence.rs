//! Dashboard presence view
//!
//! A [`PresenceObserver`] keeps a local copy of the sessions visible under one
//! [`SessionScope`] by applying change events incrementally instead of re-reading
//! the whole set. A full re-read only happens when the feed reports it dropped
//! events.

use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{ChangeEvent, SessionScope, TunnelSession};
use crate::store::{FeedEvent, SessionStore, StoreError, Subscription};

/// Local collection of sessions, keyed by session id. Order is not significant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceView {
    sessions: Vec<TunnelSession>,
}

impl PresenceView {
    pub fn new(sessions: Vec<TunnelSession>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &[TunnelSession] {
        &self.sessions
    }

    pub fn get(&self, id: Uuid) -> Option<&TunnelSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Replace the whole collection with a fresh read
    pub fn reset(&mut self, sessions: Vec<TunnelSession>) {
        self.sessions = sessions;
    }

    /// Apply one change event; returns whether the view changed.
    ///
    /// Inserts are idempotent. An update replaces the entry in place, adds it if
    /// it was never seen, or removes it once the row no longer matches `scope`.
    pub fn apply(&mut self, scope: &SessionScope, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::Insert { record } => {
                if !scope.matches(record) || self.position(record.id).is_some() {
                    return false;
                }
                self.sessions.push(record.clone());
                true
            }
            ChangeEvent::Update { record, .. } => {
                let position = self.position(record.id);
                match (scope.matches(record), position) {
                    (true, Some(index)) => {
                        if self.sessions[index] == *record {
                            return false;
                        }
                        self.sessions[index] = record.clone();
                        true
                    }
                    (true, None) => {
                        self.sessions.push(record.clone());
                        true
                    }
                    (false, Some(index)) => {
                        self.sessions.remove(index);
                        true
                    }
                    (false, None) => false,
                }
            }
            ChangeEvent::Delete { old } => match self.position(old.id) {
                Some(index) => {
                    self.sessions.remove(index);
                    true
                }
                None => false,
            },
        }
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }
}

/// Live view of the sessions under one scope
///
/// Dropping the observer (or calling [`PresenceObserver::unsubscribe`]) tears down
/// the feed listener.
pub struct PresenceObserver {
    scope: SessionScope,
    view: Arc<RwLock<PresenceView>>,
    version: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl PresenceObserver {
    /// Subscribe to `scope` and load the initial set.
    ///
    /// The feed is opened before the initial read so no change between the two
    /// is missed; events that raced the read are absorbed by idempotent apply.
    pub async fn subscribe(
        store: Arc<dyn SessionStore>,
        scope: SessionScope,
    ) -> Result<Self, StoreError> {
        let subscription = store.subscribe(scope).await?;
        let initial = store.list_tunnels(&scope).await?;
        info!("Observing {} ({} sessions)", scope, initial.len());

        let view = Arc::new(RwLock::new(PresenceView::new(initial)));
        let (version_tx, version) = watch::channel(0u64);

        let task = tokio::spawn(reconcile(
            store,
            subscription,
            view.clone(),
            version_tx,
        ));

        Ok(Self {
            scope,
            view,
            version,
            task,
        })
    }

    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    pub async fn snapshot(&self) -> Vec<TunnelSession> {
        self.view.read().await.sessions().to_vec()
    }

    /// Version counter bumped on every change to the view
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.version.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn unsubscribe(self) {
        debug!("Presence observer for {} unsubscribed", self.scope);
    }
}

impl Drop for PresenceObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reconcile(
    store: Arc<dyn SessionStore>,
    mut subscription: Subscription,
    view: Arc<RwLock<PresenceView>>,
    version: watch::Sender<u64>,
) {
    let scope = *subscription.scope();

    while let Some(item) = subscription.recv().await {
        let changed = match item {
            FeedEvent::Change(event) => view.write().await.apply(&scope, &event),
            FeedEvent::Lagged(skipped) => {
                info!("Resynchronizing {} after {} missed events", scope, skipped);
                match store.list_tunnels(&scope).await {
                    Ok(sessions) => {
                        view.write().await.reset(sessions);
                        true
                    }
                    Err(e) => {
                        warn!("Failed to resynchronize {}: {}", scope, e);
                        false
                    }
                }
            }
        };

        if changed {
            version.send_modify(|v| *v += 1);
        }
    }

    debug!("Change feed for {} ended", scope);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTunnelSession, Privacy, SessionStatus};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    fn session(user_id: Uuid) -> TunnelSession {
        NewTunnelSession {
            user_id,
            team_id: None,
            current_url: "https://bold-emu.loca.lt".to_string(),
            local_port: 5173,
            privacy: Privacy::Public,
        }
        .into_session(Uuid::new_v4(), Utc::now())
    }

    fn offline(session: &TunnelSession) -> TunnelSession {
        TunnelSession {
            status: SessionStatus::Offline,
            ..session.clone()
        }
    }

    #[test]
    fn test_duplicate_insert_is_idempotent() {
        let owner = Uuid::new_v4();
        let scope = SessionScope::Owner(owner);
        let record = session(owner);
        let mut view = PresenceView::default();

        let event = ChangeEvent::Insert {
            record: record.clone(),
        };
        assert!(view.apply(&scope, &event));
        assert!(!view.apply(&scope, &event));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_update_replaces_in_place() {
        let owner = Uuid::new_v4();
        let scope = SessionScope::Owner(owner);
        let first = session(owner);
        let second = session(owner);
        let mut view = PresenceView::new(vec![first.clone(), second.clone()]);

        let changed = view.apply(
            &scope,
            &ChangeEvent::Update {
                record: offline(&first),
                old: first.clone(),
            },
        );
        assert!(changed);
        assert_eq!(view.sessions()[0].status, SessionStatus::Offline);
        assert_eq!(view.sessions()[1], second);
    }

    #[test]
    fn test_update_out_of_scope_removes() {
        let record = session(Uuid::new_v4());
        let mut view = PresenceView::new(vec![record.clone()]);

        view.apply(
            &SessionScope::Community,
            &ChangeEvent::Update {
                record: offline(&record),
                old: record.clone(),
            },
        );
        assert!(view.is_empty());
    }

    #[test]
    fn test_update_of_unseen_row_is_added() {
        let owner = Uuid::new_v4();
        let record = session(owner);
        let mut view = PresenceView::default();

        view.apply(
            &SessionScope::Owner(owner),
            &ChangeEvent::Update {
                record: record.clone(),
                old: record.clone(),
            },
        );
        assert_eq!(view.get(record.id), Some(&record));
    }

    #[test]
    fn test_delete_removes() {
        let owner = Uuid::new_v4();
        let record = session(owner);
        let mut view = PresenceView::new(vec![record.clone()]);

        assert!(view.apply(&SessionScope::Owner(owner), &ChangeEvent::Delete { old: record }));
        assert!(view.is_empty());
    }

    async fn wait_for_version(observer: &PresenceObserver, at_least: u64) {
        let mut updates = observer.updates();
        tokio::time::timeout(Duration::from_secs(1), updates.wait_for(|v| *v >= at_least))
            .await
            .expect("view did not update in time")
            .expect("observer stopped");
    }

    #[tokio::test]
    async fn test_observer_tracks_store() {
        let store = Arc::new(MemoryStore::new());
        let owner = Uuid::new_v4();
        let observer = PresenceObserver::subscribe(store.clone(), SessionScope::Owner(owner))
            .await
            .unwrap();
        assert!(observer.snapshot().await.is_empty());

        let record = store
            .insert_tunnel(NewTunnelSession {
                user_id: owner,
                team_id: None,
                current_url: "https://lazy-gnu.loca.lt".to_string(),
                local_port: 8000,
                privacy: Privacy::Private,
            })
            .await
            .unwrap();
        wait_for_version(&observer, 1).await;
        assert_eq!(observer.snapshot().await, vec![record.clone()]);

        store
            .set_tunnel_status(record.id, SessionStatus::Offline)
            .await
            .unwrap();
        wait_for_version(&observer, 2).await;
        assert_eq!(observer.snapshot().await[0].status, SessionStatus::Offline);

        store.delete_tunnel(record.id).await.unwrap();
        wait_for_version(&observer, 3).await;
        assert!(observer.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_feed() {
        let store = Arc::new(MemoryStore::new());
        let observer = PresenceObserver::subscribe(store.clone(), SessionScope::Community)
            .await
            .unwrap();
        assert_eq!(store.change_bus().subscriber_count(), 1);

        observer.unsubscribe();

        for _ in 0..50 {
            if store.change_bus().subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.change_bus().subscriber_count(), 0);
    }
}
