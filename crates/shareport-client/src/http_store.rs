//! [`SessionStore`] over the store REST API
//!
//! This is the handle the CLI passes into every core component. Transport
//! failures surface as [`StoreError::Unavailable`] so the session manager can
//! degrade to offline mode and the poller can fail the login.
//!
//! Sessions created through a handle are written with the write key the server
//! issued for them; the keys live only in this process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use shareport_core::model::{
    ChangeEvent, DeviceRequest, DeviceStatus, NewTunnelSession, SessionScope, SessionStatus,
    TunnelSession,
};
use shareport_core::store::{FeedEvent, SessionStore, StoreError, Subscription};
use shareport_core::wire::{
    CreateDeviceRequest, DeviceTransition, HeartbeatUpdate, LaggedNotice, MutationResult,
    RegisteredSession, ScopeQuery, StatusUpdate, TeamInfo, CHANGE_EVENT, LAGGED_EVENT,
    SESSION_KEY_HEADER,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sse::SseParser;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Feed reconnect backoff
const FEED_RETRY_INITIAL: Duration = Duration::from_secs(1);
const FEED_RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    code: Option<String>,
}

fn transport_err(err: reqwest::Error) -> StoreError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

async fn status_err(response: Response) -> StoreError {
    let status = response.status();
    let detail = match response.json::<ErrorBody>().await {
        Ok(body) => match body.code {
            Some(code) => format!("{} ({})", body.error, code),
            None => body.error,
        },
        Err(_) => status.to_string(),
    };

    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(detail),
        StatusCode::CONFLICT => StoreError::Conflict(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Forbidden(detail),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            StoreError::Unavailable(detail)
        }
        _ => StoreError::Backend(detail),
    }
}

/// Network handle to the store
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
    token: Option<String>,
    write_keys: Arc<Mutex<HashMap<Uuid, String>>>,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            write_keys: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Authenticate requests with the placeholder credential from `login`
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Request against a session row, carrying its write key when this handle created it
    fn session_request(&self, method: Method, path: &str, id: Uuid) -> RequestBuilder {
        let builder = self.request(method, path);
        let key = self
            .write_keys
            .lock()
            .ok()
            .and_then(|keys| keys.get(&id).cloned());
        match key {
            Some(key) => builder.header(SESSION_KEY_HEADER, key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = builder
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err(response).await);
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, StoreError> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(transport_err)
    }

    /// Like [`Self::send_json`] but a 404 is an absent row rather than an error
    async fn send_optional<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<Option<T>, StoreError> {
        match self.send_json(builder).await {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn mutation(&self, builder: RequestBuilder) -> Result<bool, StoreError> {
        match self.send_json::<MutationResult>(builder).await {
            Ok(result) => Ok(result.updated),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn open_feed(&self, scope: &SessionScope) -> Result<Response, StoreError> {
        // No overall timeout: the response body is the long-lived feed
        let response = self
            .request(Method::GET, "/api/tunnels/changes")
            .query(&ScopeQuery::from(scope))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl SessionStore for HttpStore {
    async fn insert_device_request(&self, device_code: &str) -> Result<DeviceRequest, StoreError> {
        let body = CreateDeviceRequest {
            device_code: device_code.to_string(),
        };
        self.send_json(self.request(Method::POST, "/api/device-requests").json(&body))
            .await
    }

    async fn find_device_request(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceRequest>, StoreError> {
        let path = format!("/api/device-requests/{}", device_code);
        self.send_optional(self.request(Method::GET, &path)).await
    }

    async fn transition_device_request(
        &self,
        device_code: &str,
        from: DeviceStatus,
        to: DeviceStatus,
        user_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let path = format!("/api/device-requests/{}", device_code);
        let body = DeviceTransition { from, to, user_id };
        self.mutation(self.request(Method::PATCH, &path).json(&body))
            .await
    }

    async fn purge_device_requests(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Err(StoreError::Forbidden(
            "device request retention runs on the server".to_string(),
        ))
    }

    async fn insert_tunnel(&self, session: NewTunnelSession) -> Result<TunnelSession, StoreError> {
        let registered: RegisteredSession = self
            .send_json(self.request(Method::POST, "/api/tunnels").json(&session))
            .await?;

        let session = registered.session;
        if let Ok(mut keys) = self.write_keys.lock() {
            keys.insert(session.id, registered.write_key);
        }
        Ok(session)
    }

    async fn find_tunnel(&self, id: Uuid) -> Result<Option<TunnelSession>, StoreError> {
        let path = format!("/api/tunnels/{}", id);
        self.send_optional(self.request(Method::GET, &path)).await
    }

    async fn touch_tunnel(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let path = format!("/api/tunnels/{}/heartbeat", id);
        let body = HeartbeatUpdate { at, revive: false };
        self.mutation(self.session_request(Method::PATCH, &path, id).json(&body))
            .await
    }

    async fn revive_tunnel(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let path = format!("/api/tunnels/{}/heartbeat", id);
        let body = HeartbeatUpdate { at, revive: true };
        self.mutation(self.session_request(Method::PATCH, &path, id).json(&body))
            .await
    }

    async fn set_tunnel_status(&self, id: Uuid, status: SessionStatus) -> Result<bool, StoreError> {
        let path = format!("/api/tunnels/{}/status", id);
        self.mutation(
            self.session_request(Method::PATCH, &path, id)
                .json(&StatusUpdate { status }),
        )
        .await
    }

    async fn delete_tunnel(&self, id: Uuid) -> Result<bool, StoreError> {
        let path = format!("/api/tunnels/{}", id);
        let deleted = self
            .mutation(self.session_request(Method::DELETE, &path, id))
            .await?;
        if let Ok(mut keys) = self.write_keys.lock() {
            keys.remove(&id);
        }
        Ok(deleted)
    }

    async fn list_tunnels(&self, scope: &SessionScope) -> Result<Vec<TunnelSession>, StoreError> {
        self.send_json(
            self.request(Method::GET, "/api/tunnels")
                .query(&ScopeQuery::from(scope)),
        )
        .await
    }

    async fn mark_stale_tunnels(&self, _cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        Err(StoreError::Forbidden(
            "the staleness sweep runs on the server".to_string(),
        ))
    }

    async fn resolve_team(&self, slug: &str) -> Result<Option<Uuid>, StoreError> {
        let path = format!("/api/teams/{}", slug);
        let team: Option<TeamInfo> = self.send_optional(self.request(Method::GET, &path)).await?;
        Ok(team.map(|team| team.id))
    }

    async fn subscribe(&self, scope: SessionScope) -> Result<Subscription, StoreError> {
        let response = self.open_feed(&scope).await?;
        info!("Subscribed to {} changes", scope);

        let (tx, rx) = Subscription::channel();
        let listener = tokio::spawn(run_feed(self.clone(), scope, response, tx));
        Ok(Subscription::new(scope, rx, listener))
    }
}

enum FeedEnd {
    /// Nobody is listening any more
    Dropped,
    Disconnected(String),
}

/// Forward feed events, reconnecting with backoff whenever the stream breaks
async fn run_feed(
    store: HttpStore,
    scope: SessionScope,
    mut response: Response,
    tx: mpsc::Sender<FeedEvent>,
) {
    loop {
        match pump(response, &tx).await {
            FeedEnd::Dropped => return,
            FeedEnd::Disconnected(reason) => {
                warn!("Change feed for {} disconnected: {}", scope, reason);
            }
        }

        let mut backoff = FEED_RETRY_INITIAL;
        response = loop {
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(backoff).await;

            match store.open_feed(&scope).await {
                Ok(response) => break response,
                Err(StoreError::Forbidden(reason)) => {
                    warn!("Change feed for {} no longer permitted: {}", scope, reason);
                    return;
                }
                Err(e) => {
                    debug!("Reconnecting change feed for {} failed: {}", scope, e);
                    backoff = (backoff * 2).min(FEED_RETRY_MAX);
                }
            }
        };
        info!("Change feed for {} reconnected", scope);

        // Changes made while disconnected were not delivered
        if tx.send(FeedEvent::Lagged(0)).await.is_err() {
            return;
        }
    }
}

async fn pump(response: Response, tx: &mpsc::Sender<FeedEvent>) -> FeedEnd {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::default();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return FeedEnd::Disconnected(e.to_string()),
        };

        for event in parser.feed(&chunk) {
            let item = match event.name() {
                CHANGE_EVENT => match serde_json::from_str::<ChangeEvent>(&event.data) {
                    Ok(change) => FeedEvent::Change(change),
                    Err(e) => {
                        warn!("Ignoring malformed change event: {}", e);
                        continue;
                    }
                },
                LAGGED_EVENT => {
                    let skipped = serde_json::from_str::<LaggedNotice>(&event.data)
                        .map(|notice| notice.skipped)
                        .unwrap_or_default();
                    FeedEvent::Lagged(skipped)
                }
                other => {
                    debug!("Ignoring feed event '{}'", other);
                    continue;
                }
            };

            if tx.send(item).await.is_err() {
                return FeedEnd::Dropped;
            }
        }
    }

    FeedEnd::Disconnected("stream ended".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        // Port 9 (discard) is closed on any sane test host
        let store = HttpStore::new("http://127.0.0.1:9").unwrap();

        let result = store.find_device_request("ABCD2345").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_housekeeping_is_server_side() {
        let store = HttpStore::new("http://127.0.0.1:9").unwrap();
        assert!(matches!(
            store.mark_stale_tunnels(Utc::now()).await,
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            store.purge_device_requests(Utc::now()).await,
            Err(StoreError::Forbidden(_))
        ));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let store = HttpStore::new("http://localhost:3080/").unwrap();
        assert_eq!(store.base_url(), "http://localhost:3080");
    }
}
