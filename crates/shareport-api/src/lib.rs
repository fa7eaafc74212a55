//! Store REST API
//!
//! Serves the `device_requests` and `tunnels` tables to the CLI and the
//! dashboards, the browser page that approves device codes, and the change
//! feed. The server is the only writer to the database, so the in-process
//! change bus of [`DbStore`] carries every row change.

pub mod csrf;
pub mod handlers;
pub mod housekeeping;
pub mod middleware;
pub mod models;
pub mod page;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, patch, post},
    Router,
};
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;

use csrf::CsrfTokens;
use housekeeping::{Housekeeping, HousekeepingConfig};
use shareport_core::wire::SESSION_KEY_HEADER;
use shareport_core::{DeviceAuthService, SessionStore};
use shareport_relay_db::DbStore;

/// Application state shared across handlers
pub struct AppState {
    pub store: DbStore,
    pub auth: DeviceAuthService,
    pub csrf: CsrfTokens,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "shareport API",
        version = "0.1.0",
        description = "Device authorization and tunnel session presence"
    ),
    paths(
        handlers::health_check,
        handlers::device::create_device_request,
        handlers::device::get_device_request,
        handlers::device::transition_device_request,
        handlers::tunnels::create_tunnel,
        handlers::tunnels::get_tunnel,
        handlers::tunnels::heartbeat,
        handlers::tunnels::set_status,
        handlers::tunnels::delete_tunnel,
        handlers::tunnels::list_tunnels,
        handlers::tunnels::list_community,
        handlers::tunnels::changes,
        handlers::teams::get_team,
    ),
    components(
        schemas(
            models::ErrorResponse,
            models::HealthResponse,
            shareport_core::DeviceStatus,
            shareport_core::DeviceRequest,
            shareport_core::SessionStatus,
            shareport_core::Privacy,
            shareport_core::TunnelSession,
            shareport_core::NewTunnelSession,
            shareport_core::ChangeEvent,
            shareport_core::wire::CreateDeviceRequest,
            shareport_core::wire::DeviceTransition,
            shareport_core::wire::HeartbeatUpdate,
            shareport_core::wire::RegisteredSession,
            shareport_core::wire::StatusUpdate,
            shareport_core::wire::MutationResult,
            shareport_core::wire::TeamInfo,
        )
    ),
    tags(
        (name = "device", description = "Device authorization requests"),
        (name = "tunnels", description = "Tunnel session presence"),
        (name = "teams", description = "Team lookup"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Allow browser dashboards served from localhost
    pub enable_cors: bool,
    pub housekeeping: HousekeepingConfig,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3080)),
            enable_cors: true,
            housekeeping: HousekeepingConfig::default(),
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, store: DbStore) -> Self {
        let auth = DeviceAuthService::new(Arc::new(store.clone()));
        let state = Arc::new(AppState {
            store,
            auth,
            csrf: CsrfTokens::new(),
        });

        Self { config, state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/openapi.json", get(handlers::openapi_json))
            .route(
                "/api/device-requests",
                post(handlers::device::create_device_request),
            )
            .route(
                "/api/device-requests/{code}",
                get(handlers::device::get_device_request)
                    .patch(handlers::device::transition_device_request),
            )
            .route(
                "/api/tunnels",
                get(handlers::tunnels::list_tunnels).post(handlers::tunnels::create_tunnel),
            )
            .route(
                "/api/tunnels/community",
                get(handlers::tunnels::list_community),
            )
            .route("/api/tunnels/changes", get(handlers::tunnels::changes))
            .route(
                "/api/tunnels/{id}",
                get(handlers::tunnels::get_tunnel).delete(handlers::tunnels::delete_tunnel),
            )
            .route(
                "/api/tunnels/{id}/heartbeat",
                patch(handlers::tunnels::heartbeat),
            )
            .route(
                "/api/tunnels/{id}/status",
                patch(handlers::tunnels::set_status),
            )
            .route("/api/teams/{slug}", get(handlers::teams::get_team));

        let page_router = Router::new()
            .route("/device", get(page::device_page))
            .route("/device/approve", post(page::approve));

        let mut router = api_router
            .merge(page_router)
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::resolve_caller,
            ))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            use tower_http::cors::AllowOrigin;

            // Cookie auth needs credentials, which rules out a wildcard origin
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::PATCH])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    header::COOKIE,
                    HeaderName::from_static(SESSION_KEY_HEADER),
                ])
                .allow_credentials(true)
                .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                        || origin_str.starts_with("https://localhost:")
                        || origin_str.starts_with("https://127.0.0.1:")
                }));
            router = router.layer(cors);
        }

        router
    }

    /// Serve until `shutdown` resolves, running housekeeping alongside
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Like [`Self::start`] on an already bound listener
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let addr = listener.local_addr()?;

        info!("🚀 Starting API server on {}", addr);
        info!("OpenAPI spec: http://{}/api/openapi.json", addr);
        info!("Device approval page: http://{}/device", addr);

        let store: Arc<dyn SessionStore> = Arc::new(self.state.store.clone());
        let housekeeping = Housekeeping::spawn(store, self.config.housekeeping.clone());

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        housekeeping.stop().await;
        result.map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("API server stopped");
        Ok(())
    }
}
