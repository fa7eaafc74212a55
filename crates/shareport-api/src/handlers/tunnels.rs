//! `tunnels` endpoints and the change feed
//!
//! Each session gets a write key when it is created, and only requests carrying
//! that key may heartbeat, close or delete it. Reads follow the dashboard
//! scopes: owners see their own sessions, team members see the team's, and
//! everyone sees the community listing. Rows are redacted to what the reader's
//! view allows, so owner ids never reach other users.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use futures::stream::{self, Stream};
use shareport_core::wire::{
    generate_write_key, HeartbeatUpdate, LaggedNotice, MutationResult, RegisteredSession,
    ScopeQuery, StatusUpdate, CHANGE_EVENT, LAGGED_EVENT, SESSION_KEY_HEADER,
};
use shareport_core::{
    FeedEvent, NewTunnelSession, RowView, SessionScope, SessionStatus, SessionStore,
    TunnelSession, ANONYMOUS_USER_ID,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{api_error, store_error, ApiError};
use crate::middleware::Caller;
use crate::models::ErrorResponse;
use crate::AppState;

const FEED_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Register a tunnel session
#[utoipa::path(
    post,
    path = "/api/tunnels",
    request_body = NewTunnelSession,
    responses(
        (status = 201, description = "Session created, with its write key", body = RegisteredSession),
        (status = 401, description = "Team sessions require a signed-in caller", body = ErrorResponse),
        (status = 403, description = "Caller may not create this row", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<NewTunnelSession>,
) -> Result<(StatusCode, Json<RegisteredSession>), ApiError> {
    match caller.user_id() {
        None if req.user_id != ANONYMOUS_USER_ID => {
            return Err(api_error(
                StatusCode::FORBIDDEN,
                "OWNER_MISMATCH",
                "Anonymous sessions must be owned by the anonymous user",
            ));
        }
        Some(user_id) if req.user_id != user_id => {
            return Err(api_error(
                StatusCode::FORBIDDEN,
                "OWNER_MISMATCH",
                "Sessions can only be created for the signed-in user",
            ));
        }
        _ => {}
    }

    if let Some(team_id) = req.team_id {
        let user_id = caller.require()?;
        require_membership(&state, team_id, user_id).await?;
    }

    let write_key = generate_write_key();
    let session = state
        .store
        .register_tunnel(req, &write_key)
        .await
        .map_err(store_error)?;

    info!(
        "Tunnel session {} registered for port {} at {}",
        session.id, session.local_port, session.current_url
    );
    Ok((
        StatusCode::CREATED,
        Json(RegisteredSession { session, write_key }),
    ))
}

/// Read one tunnel session
#[utoipa::path(
    get,
    path = "/api/tunnels/{id}",
    params(
        ("id" = Uuid, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Tunnel session", body = TunnelSession),
        (status = 404, description = "Session not found or not visible", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<TunnelSession>, ApiError> {
    let session = find_session(&state, id).await?;

    match row_view(&state, &caller, &session).await? {
        Some(view) => Ok(Json(session.redact(view))),
        None => Err(not_found(id)),
    }
}

/// Record a heartbeat
#[utoipa::path(
    patch,
    path = "/api/tunnels/{id}/heartbeat",
    params(
        ("id" = Uuid, Path, description = "Session ID")
    ),
    request_body = HeartbeatUpdate,
    responses(
        (status = 200, description = "Whether the session was still online, or was revived", body = MutationResult),
        (status = 401, description = "Missing session write key", body = ErrorResponse),
        (status = 403, description = "Wrong session write key", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<HeartbeatUpdate>,
) -> Result<Json<MutationResult>, ApiError> {
    authorize_write(&state, &headers, id).await?;

    let write = if req.revive {
        state.store.revive_tunnel(id, req.at).await
    } else {
        state.store.touch_tunnel(id, req.at).await
    };
    let updated = write.map_err(store_error)?;
    Ok(Json(MutationResult { updated }))
}

/// Set a session's status
#[utoipa::path(
    patch,
    path = "/api/tunnels/{id}/status",
    params(
        ("id" = Uuid, Path, description = "Session ID")
    ),
    request_body = StatusUpdate,
    responses(
        (status = 200, description = "Whether the status changed", body = MutationResult),
        (status = 401, description = "Missing session write key", body = ErrorResponse),
        (status = 403, description = "Wrong session write key, or a transition other than to offline", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn set_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusUpdate>,
) -> Result<Json<MutationResult>, ApiError> {
    authorize_write(&state, &headers, id).await?;

    // Going back online is the heartbeat's job
    if req.status != SessionStatus::Offline {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "INVALID_TRANSITION",
            "Sessions can only be set offline",
        ));
    }

    let updated = state
        .store
        .set_tunnel_status(id, req.status)
        .await
        .map_err(store_error)?;
    if updated {
        info!("Tunnel session {} is now {}", id, req.status);
    }
    Ok(Json(MutationResult { updated }))
}

/// Delete a tunnel session
#[utoipa::path(
    delete,
    path = "/api/tunnels/{id}",
    params(
        ("id" = Uuid, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Whether a row was deleted", body = MutationResult),
        (status = 401, description = "Missing session write key", body = ErrorResponse),
        (status = 403, description = "Wrong session write key", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<MutationResult>, ApiError> {
    authorize_write(&state, &headers, id).await?;

    let updated = state.store.delete_tunnel(id).await.map_err(store_error)?;
    if updated {
        info!("Tunnel session {} deleted", id);
    }
    Ok(Json(MutationResult { updated }))
}

/// List sessions visible under a scope
#[utoipa::path(
    get,
    path = "/api/tunnels",
    params(ScopeQuery),
    responses(
        (status = 200, description = "Sessions, newest first", body = Vec<TunnelSession>),
        (status = 400, description = "Malformed scope", body = ErrorResponse),
        (status = 401, description = "Scope requires a signed-in caller", body = ErrorResponse),
        (status = 403, description = "Caller may not read this scope", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<Vec<TunnelSession>>, ApiError> {
    let scope = authorize_scope(&state, &caller, &query).await?;
    debug!("Listing tunnels for {}", scope);

    let sessions = state
        .store
        .list_tunnels(&scope)
        .await
        .map_err(store_error)?;
    Ok(Json(redact_all(sessions, scope.view())))
}

/// Online public sessions
#[utoipa::path(
    get,
    path = "/api/tunnels/community",
    responses(
        (status = 200, description = "Community listing, newest first", body = Vec<TunnelSession>)
    ),
    tag = "tunnels"
)]
pub async fn list_community(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TunnelSession>>, ApiError> {
    let sessions = state
        .store
        .list_tunnels(&SessionScope::Community)
        .await
        .map_err(store_error)?;
    Ok(Json(redact_all(sessions, RowView::Public)))
}

fn redact_all(sessions: Vec<TunnelSession>, view: RowView) -> Vec<TunnelSession> {
    sessions
        .into_iter()
        .map(|session| session.redact(view))
        .collect()
}

/// Server-sent change feed for a scope
///
/// Emits a `change` event carrying a `ChangeEvent` per row change, and a
/// `lagged` event when this subscriber fell behind and should refetch.
#[utoipa::path(
    get,
    path = "/api/tunnels/changes",
    params(ScopeQuery),
    responses(
        (status = 200, description = "text/event-stream of row changes"),
        (status = 401, description = "Scope requires a signed-in caller", body = ErrorResponse),
        (status = 403, description = "Caller may not read this scope", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn changes(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ScopeQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let scope = authorize_scope(&state, &caller, &query).await?;
    let subscription = state.store.subscribe(scope).await.map_err(store_error)?;
    info!("📡 Change feed opened for {}", scope);

    let view = scope.view();
    let events = stream::unfold(subscription, move |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((feed_event(event, view), subscription))
    });

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(FEED_KEEP_ALIVE)
            .text("keep-alive"),
    ))
}

fn feed_event(event: FeedEvent, view: RowView) -> Result<Event, axum::Error> {
    match event {
        FeedEvent::Change(change) => Event::default()
            .event(CHANGE_EVENT)
            .json_data(change.redact(view)),
        FeedEvent::Lagged(skipped) => {
            warn!("Change feed subscriber lagged by {} events", skipped);
            Event::default()
                .event(LAGGED_EVENT)
                .json_data(LaggedNotice { skipped })
        }
    }
}

async fn find_session(state: &AppState, id: Uuid) -> Result<TunnelSession, ApiError> {
    state
        .store
        .find_tunnel(id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found(id))
}

async fn require_membership(state: &AppState, team_id: Uuid, user_id: Uuid) -> Result<(), ApiError> {
    let member = state
        .store
        .is_team_member(team_id, user_id)
        .await
        .map_err(store_error)?;
    if !member {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "NOT_A_MEMBER",
            format!("Not a member of team {}", team_id),
        ));
    }
    Ok(())
}

/// How much of `session` the caller may see, or `None` if it is hidden from them
async fn row_view(
    state: &AppState,
    caller: &Caller,
    session: &TunnelSession,
) -> Result<Option<RowView>, ApiError> {
    if session.user_id != ANONYMOUS_USER_ID && caller.is(session.user_id) {
        return Ok(Some(RowView::Owner));
    }

    if let (Some(team_id), Some(user_id)) = (session.team_id, caller.user_id()) {
        let member = state
            .store
            .is_team_member(team_id, user_id)
            .await
            .map_err(store_error)?;
        if member {
            return Ok(Some(RowView::Team));
        }
    }

    if session.user_id == ANONYMOUS_USER_ID || SessionScope::Community.matches(session) {
        return Ok(Some(RowView::Public));
    }
    Ok(None)
}

/// Write-key check for row writes; also rejects unknown ids with 404
async fn authorize_write(state: &AppState, headers: &HeaderMap, id: Uuid) -> Result<(), ApiError> {
    find_session(state, id).await?;

    let key = headers
        .get(SESSION_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "SESSION_KEY_REQUIRED",
                format!("Writes to a session need the {} header", SESSION_KEY_HEADER),
            )
        })?;

    let valid = state
        .store
        .check_write_key(id, key)
        .await
        .map_err(store_error)?;
    if !valid {
        warn!("Rejected write to tunnel session {} with a wrong key", id);
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "INVALID_SESSION_KEY",
            format!("Wrong write key for tunnel session {}", id),
        ));
    }
    Ok(())
}

async fn authorize_scope(
    state: &AppState,
    caller: &Caller,
    query: &ScopeQuery,
) -> Result<SessionScope, ApiError> {
    let scope = query
        .to_scope()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_SCOPE", e))?;

    match scope {
        SessionScope::Community => {}
        SessionScope::Owner(owner) => {
            if caller.require()? != owner {
                return Err(api_error(
                    StatusCode::FORBIDDEN,
                    "NOT_OWNER",
                    "Owner dashboards are only visible to their owner",
                ));
            }
        }
        SessionScope::Team(team_id) => {
            let user_id = caller.require()?;
            require_membership(state, team_id, user_id).await?;
        }
    }
    Ok(scope)
}

fn not_found(id: Uuid) -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        "TUNNEL_NOT_FOUND",
        format!("Tunnel session '{}' not found", id),
    )
}
