//! Integration tests for the store REST API

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use shareport_api::{models::*, ApiServer, ApiServerConfig};
use shareport_core::wire::{MutationResult, RegisteredSession, TeamInfo, SESSION_KEY_HEADER};
use shareport_core::{
    DeviceRequest, DeviceStatus, NewTunnelSession, Privacy, SessionStatus, SessionStore,
    TunnelSession, ANONYMOUS_USER_ID,
};
use shareport_relay_db::entities::team_member::TeamRole;
use shareport_relay_db::{connect, migrate, DbStore};
use std::time::Duration;
use tower::ServiceExt; // For `oneshot` method
use uuid::Uuid;

/// Helper to create a migrated in-memory store
async fn create_test_store() -> DbStore {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    migrate(&db).await.expect("Failed to run migrations");
    DbStore::new(db)
}

fn create_test_app(store: DbStore) -> Router {
    let config = ApiServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        enable_cors: false,
        ..Default::default()
    };
    ApiServer::new(config, store).build_router()
}

fn request(method: &str, uri: &str, token: Option<Uuid>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri).method(method);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn with_key(mut request: Request<Body>, key: &str) -> Request<Body> {
    request
        .headers_mut()
        .insert(SESSION_KEY_HEADER, key.parse().unwrap());
    request
}

fn approve_form(user_id: Uuid, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/device/approve")
        .header(header::HOST, "localhost")
        .header(header::COOKIE, format!("session_token={}", user_id))
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

/// Open the device page as `user_id` and pull the form token out of it
async fn page_token(app: &Router, user_id: Uuid, code: &str) -> String {
    let page = Request::builder()
        .uri(format!("/device?code={}", code))
        .header(header::COOKIE, format!("session_token={}", user_id))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(page).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = read_text(response).await;
    let marker = r#"name="csrf_token" value=""#;
    let start = html.find(marker).expect("confirm form has a token") + marker.len();
    let len = html[start..].find('"').unwrap();
    html[start..start + len].to_string()
}

async fn read_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn read_text(response: axum::response::Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

fn new_session(user_id: Uuid, team_id: Option<Uuid>) -> Value {
    serde_json::to_value(NewTunnelSession {
        user_id,
        team_id,
        current_url: "https://brave-otter.loca.lt".to_string(),
        local_port: 3000,
        privacy: Privacy::Public,
    })
    .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = create_test_app(create_test_store().await);

    let response = app
        .oneshot(request("GET", "/api/health", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health: HealthResponse = read_json(response).await;
    assert_eq!(health.status, "healthy");
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = create_test_app(create_test_store().await);

    let response = app
        .oneshot(request("GET", "/api/openapi.json", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let doc: Value = read_json(response).await;
    assert!(doc["paths"]["/api/device-requests/{code}"].is_object());
}

#[tokio::test]
async fn test_device_request_create_and_read() {
    let app = create_test_app(create_test_store().await);
    let body = json!({ "device_code": "HJKM2345" });

    let response = app
        .clone()
        .oneshot(request("POST", "/api/device-requests", None, Some(body.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: DeviceRequest = read_json(response).await;
    assert_eq!(created.status, DeviceStatus::Pending);

    let response = app
        .clone()
        .oneshot(request("POST", "/api/device-requests", None, Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error: ErrorResponse = read_json(response).await;
    assert_eq!(error.code.as_deref(), Some("CODE_EXISTS"));

    let response = app
        .clone()
        .oneshot(request("GET", "/api/device-requests/HJKM2345", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(request("GET", "/api/device-requests/NOPE2345", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_device_code_is_rejected() {
    let app = create_test_app(create_test_store().await);

    let response = app
        .oneshot(request(
            "POST",
            "/api/device-requests",
            None,
            Some(json!({ "device_code": "no spaces/please" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_approval_requires_matching_caller() {
    let store = create_test_store().await;
    let alice = store.create_user("alice@example.com", None).await.unwrap();
    let mallory = store.create_user("mallory@example.com", None).await.unwrap();
    store.insert_device_request("APPR2345").await.unwrap();
    let app = create_test_app(store.clone());

    let approve = json!({ "from": "pending", "to": "approved", "user_id": alice.id });

    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            "/api/device-requests/APPR2345",
            None,
            Some(approve.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            "/api/device-requests/APPR2345",
            Some(mallory.id),
            Some(approve.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            "/api/device-requests/APPR2345",
            Some(alice.id),
            Some(approve.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result: MutationResult = read_json(response).await;
    assert!(result.updated);

    // The compare-and-set no longer matches
    let response = app
        .oneshot(request(
            "PATCH",
            "/api/device-requests/APPR2345",
            Some(alice.id),
            Some(approve),
        ))
        .await
        .unwrap();
    let result: MutationResult = read_json(response).await;
    assert!(!result.updated);

    let row = store.find_device_request("APPR2345").await.unwrap().unwrap();
    assert_eq!(row.user_id, Some(alice.id));
}

#[tokio::test]
async fn test_expiry_only_after_deadline() {
    let app = create_test_app(create_test_store().await);
    let expire = json!({ "from": "pending", "to": "expired" });

    app.clone()
        .oneshot(request(
            "POST",
            "/api/device-requests",
            None,
            Some(json!({ "device_code": "LIVE2345" })),
        ))
        .await
        .unwrap();
    let response = app
        .oneshot(request(
            "PATCH",
            "/api/device-requests/LIVE2345",
            None,
            Some(expire.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let expired_store = create_test_store()
        .await
        .with_device_code_ttl(Duration::ZERO);
    expired_store.insert_device_request("DEAD2345").await.unwrap();
    let app = create_test_app(expired_store);

    let response = app
        .oneshot(request(
            "PATCH",
            "/api/device-requests/DEAD2345",
            None,
            Some(expire),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result: MutationResult = read_json(response).await;
    assert!(result.updated);
}

#[tokio::test]
async fn test_back_to_pending_is_forbidden() {
    let store = create_test_store().await;
    let user = store.create_user("dev@example.com", None).await.unwrap();
    store.insert_device_request("BACK2345").await.unwrap();
    let app = create_test_app(store);

    let response = app
        .oneshot(request(
            "PATCH",
            "/api/device-requests/BACK2345",
            Some(user.id),
            Some(json!({ "from": "approved", "to": "pending" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_token_is_unauthorized() {
    let app = create_test_app(create_test_store().await);

    let response = app
        .oneshot(request(
            "GET",
            "/api/tunnels/community",
            Some(Uuid::new_v4()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_tunnel_creation_rules() {
    let store = create_test_store().await;
    let owner = store.create_user("owner@example.com", None).await.unwrap();
    let other = store.create_user("other@example.com", None).await.unwrap();
    let team = store.create_team("Web", "web", other.id).await.unwrap();
    let app = create_test_app(store);

    let cases = [
        (None, new_session(ANONYMOUS_USER_ID, None), StatusCode::CREATED),
        (None, new_session(owner.id, None), StatusCode::FORBIDDEN),
        (Some(owner.id), new_session(owner.id, None), StatusCode::CREATED),
        (Some(owner.id), new_session(other.id, None), StatusCode::FORBIDDEN),
        (
            Some(owner.id),
            new_session(owner.id, Some(team.id)),
            StatusCode::FORBIDDEN,
        ),
        (
            Some(other.id),
            new_session(other.id, Some(team.id)),
            StatusCode::CREATED,
        ),
    ];

    for (caller, body, expected) in cases {
        let response = app
            .clone()
            .oneshot(request("POST", "/api/tunnels", caller, Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), expected, "caller {:?} body {}", caller, body);
    }
}

#[tokio::test]
async fn test_row_writes_need_session_key() {
    let store = create_test_store().await;
    let owner = store.create_user("owner@example.com", None).await.unwrap();
    let other = store.create_user("other@example.com", None).await.unwrap();
    let app = create_test_app(store);

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/tunnels",
            Some(owner.id),
            Some(new_session(owner.id, None)),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let RegisteredSession { session, write_key } = read_json(response).await;
    assert!(!write_key.is_empty());
    let heartbeat_uri = format!("/api/tunnels/{}/heartbeat", session.id);
    let status_uri = format!("/api/tunnels/{}/status", session.id);
    let beat = json!({ "at": chrono::Utc::now() });

    // Bearer credentials alone do not grant row writes, not even the owner's
    for caller in [None, Some(other.id), Some(owner.id)] {
        let response = app
            .clone()
            .oneshot(request("PATCH", &heartbeat_uri, caller, Some(beat.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "caller {:?}", caller);
    }

    let response = app
        .clone()
        .oneshot(with_key(
            request("PATCH", &heartbeat_uri, Some(owner.id), Some(beat.clone())),
            "not-the-key",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(with_key(
            request("PATCH", &heartbeat_uri, None, Some(beat)),
            &write_key,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result: MutationResult = read_json(response).await;
    assert!(result.updated);

    let response = app
        .clone()
        .oneshot(with_key(
            request("PATCH", &status_uri, None, Some(json!({ "status": "online" }))),
            &write_key,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(with_key(
            request("PATCH", &status_uri, None, Some(json!({ "status": "offline" }))),
            &write_key,
        ))
        .await
        .unwrap();
    let result: MutationResult = read_json(response).await;
    assert!(result.updated);

    let response = app
        .clone()
        .oneshot(with_key(
            request("DELETE", &format!("/api/tunnels/{}", session.id), None, None),
            &write_key,
        ))
        .await
        .unwrap();
    let result: MutationResult = read_json(response).await;
    assert!(result.updated);

    let response = app
        .oneshot(request(
            "GET",
            &format!("/api/tunnels/{}", session.id),
            Some(owner.id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_community_rows_cannot_be_hijacked() {
    let store = create_test_store().await;
    let owner = store.create_user("owner@example.com", None).await.unwrap();
    let app = create_test_app(store.clone());

    // One anonymous and one signed-in public session
    for (caller, body) in [
        (None, new_session(ANONYMOUS_USER_ID, None)),
        (Some(owner.id), new_session(owner.id, None)),
    ] {
        let response = app
            .clone()
            .oneshot(request("POST", "/api/tunnels", caller, Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app
        .clone()
        .oneshot(request("GET", "/api/tunnels/community", None, None))
        .await
        .unwrap();
    let community: Vec<TunnelSession> = read_json(response).await;
    assert_eq!(community.len(), 2);
    for row in &community {
        assert_eq!(row.user_id, ANONYMOUS_USER_ID);
        assert_eq!(row.team_id, None);
    }

    for row in &community {
        let status_uri = format!("/api/tunnels/{}/status", row.id);
        let delete_uri = format!("/api/tunnels/{}", row.id);
        let offline = json!({ "status": "offline" });

        let response = app
            .clone()
            .oneshot(request("PATCH", &status_uri, None, Some(offline.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(request("DELETE", &delete_uri, None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(with_key(
                request("PATCH", &status_uri, None, Some(offline)),
                "guessed",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    // The owner id never reached the listing, so presenting it gets nowhere either
    let response = app
        .clone()
        .oneshot(request("GET", "/api/tunnels/community", None, None))
        .await
        .unwrap();
    let text = read_text(response).await;
    assert!(!text.contains(&owner.id.to_string()));

    let rows = store
        .list_tunnels(&shareport_core::SessionScope::Community)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.status == SessionStatus::Online));
}

#[tokio::test]
async fn test_scoped_listing_access() {
    let store = create_test_store().await;
    let lead = store.create_user("lead@example.com", None).await.unwrap();
    let dev = store.create_user("dev@example.com", None).await.unwrap();
    let outsider = store.create_user("guest@example.com", None).await.unwrap();
    let team = store.create_team("Core", "core", lead.id).await.unwrap();
    store
        .add_team_member(team.id, dev.id, TeamRole::Member)
        .await
        .unwrap();
    let app = create_test_app(store);

    app.clone()
        .oneshot(request(
            "POST",
            "/api/tunnels",
            Some(dev.id),
            Some(new_session(dev.id, Some(team.id))),
        ))
        .await
        .unwrap();

    let team_uri = format!("/api/tunnels?scope=team&id={}", team.id);
    let response = app
        .clone()
        .oneshot(request("GET", &team_uri, Some(lead.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let sessions: Vec<TunnelSession> = read_json(response).await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].user_id, ANONYMOUS_USER_ID);
    assert_eq!(sessions[0].team_id, Some(team.id));

    let response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/api/tunnels?scope=owner&id={}", dev.id),
            Some(dev.id),
            None,
        ))
        .await
        .unwrap();
    let sessions: Vec<TunnelSession> = read_json(response).await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].user_id, dev.id);

    let response = app
        .clone()
        .oneshot(request("GET", &team_uri, Some(outsider.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let owner_uri = format!("/api/tunnels?scope=owner&id={}", dev.id);
    let response = app
        .clone()
        .oneshot(request("GET", &owner_uri, None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = app
        .clone()
        .oneshot(request("GET", &owner_uri, Some(lead.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(request("GET", "/api/tunnels/community", None, None))
        .await
        .unwrap();
    let community: Vec<TunnelSession> = read_json(response).await;
    assert_eq!(community.len(), 1);

    let response = app
        .oneshot(request("GET", "/api/tunnels?scope=galaxy", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_team_lookup_for_members() {
    let store = create_test_store().await;
    let lead = store.create_user("lead@example.com", None).await.unwrap();
    let outsider = store.create_user("guest@example.com", None).await.unwrap();
    let team = store.create_team("Core", "core", lead.id).await.unwrap();
    let app = create_test_app(store);

    let response = app
        .clone()
        .oneshot(request("GET", "/api/teams/core", Some(lead.id), None))
        .await
        .unwrap();
    let info: TeamInfo = read_json(response).await;
    assert_eq!(info.id, team.id);

    let response = app
        .clone()
        .oneshot(request("GET", "/api/teams/core", Some(outsider.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(request("GET", "/api/teams/core", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(request("GET", "/api/teams/missing", Some(lead.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_device_page_states() {
    let store = create_test_store().await;
    let user = store.create_user("dev@example.com", None).await.unwrap();
    store.insert_device_request("PAGE2345").await.unwrap();
    let app = create_test_app(store.clone());

    let response = app
        .clone()
        .oneshot(request("GET", "/device", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request("GET", "/device?code=PAGE2345", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(read_text(response).await.contains("Sign-in required"));

    let signed_in = Request::builder()
        .uri("/device?code=page2345")
        .header(header::COOKIE, format!("session_token={}", user.id))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(signed_in).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(read_text(response).await.contains("Approve"));

    let token = page_token(&app, user.id, "PAGE2345").await;
    let form = format!("code=PAGE2345&csrf_token={}", token);
    let response = app
        .clone()
        .oneshot(approve_form(user.id, form.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(read_text(response).await.contains("Approved"));

    // Tokens are single use
    let response = app.clone().oneshot(approve_form(user.id, form)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(request("GET", "/device?code=PAGE2345", Some(user.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(read_text(response).await.contains("Already used"));

    let row = store.find_device_request("PAGE2345").await.unwrap().unwrap();
    assert_eq!(row.user_id, Some(user.id));

    let response = app
        .oneshot(request("GET", "/device?code=NOPE2345", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_device_page_expired_code() {
    let store = create_test_store()
        .await
        .with_device_code_ttl(Duration::ZERO);
    let user = store.create_user("dev@example.com", None).await.unwrap();
    store.insert_device_request("GONE2345").await.unwrap();
    let server = ApiServer::new(ApiServerConfig::default(), store.clone());
    let token = server.state().csrf.issue(user.id).await;
    let app = server.build_router();

    let approve = approve_form(user.id, format!("code=GONE2345&csrf_token={}", token));
    let response = app.oneshot(approve).await.unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
    assert!(read_text(response).await.contains("Expired"));

    let row = store.find_device_request("GONE2345").await.unwrap().unwrap();
    assert_eq!(row.status, DeviceStatus::Expired);
}

#[tokio::test]
async fn test_cross_site_approval_is_refused() {
    let store = create_test_store().await;
    let victim = store.create_user("victim@example.com", None).await.unwrap();
    let attacker = store.create_user("attacker@example.com", None).await.unwrap();
    store.insert_device_request("EVIL2345").await.unwrap();
    let app = create_test_app(store.clone());

    // Auto-submitting form on another site: victim's cookie, no token
    let mut forged = approve_form(victim.id, "code=EVIL2345".to_string());
    forged
        .headers_mut()
        .insert(header::ORIGIN, "https://evil.example".parse().unwrap());
    let response = app.clone().oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Same-site post without the page token
    let response = app
        .clone()
        .oneshot(approve_form(victim.id, "code=EVIL2345".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // A token rendered for someone else
    let token = page_token(&app, attacker.id, "EVIL2345").await;
    let response = app
        .clone()
        .oneshot(approve_form(
            victim.id,
            format!("code=EVIL2345&csrf_token={}", token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Even a valid token is refused from a foreign origin
    let token = page_token(&app, victim.id, "EVIL2345").await;
    let mut forged = approve_form(victim.id, format!("code=EVIL2345&csrf_token={}", token));
    forged
        .headers_mut()
        .insert("sec-fetch-site", "cross-site".parse().unwrap());
    let response = app.oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let row = store.find_device_request("EVIL2345").await.unwrap().unwrap();
    assert_eq!(row.status, DeviceStatus::Pending);
    assert_eq!(row.user_id, None);
}

#[tokio::test]
async fn test_change_feed_streams_events() {
    let store = create_test_store().await;
    let app = create_test_app(store.clone());

    let response = app
        .oneshot(request(
            "GET",
            "/api/tunnels/changes?scope=community",
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();

    let session = store
        .insert_tunnel(NewTunnelSession {
            user_id: ANONYMOUS_USER_ID,
            team_id: None,
            current_url: "https://late-lark.loca.lt".to_string(),
            local_port: 5173,
            privacy: Privacy::Public,
        })
        .await
        .unwrap();

    let mut received = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !received.contains("\n\n") {
            let chunk = body.next().await.unwrap().unwrap();
            received.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .expect("no change event within 5s");

    assert!(received.contains("event: change"));
    assert!(received.contains(&session.id.to_string()));
}
