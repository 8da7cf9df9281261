use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use relay_core::auth::{Authenticator, Identity, TopicAuthorizer};
use relay_telemetry::MetricsRecorder;
use tower_http::cors::CorsLayer;

use crate::router::TopicRouter;
use crate::session::{run_session, start_cleanup_task, SessionHandle};

/// Hub configuration.
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 9400,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            cleanup_interval_secs: 60,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<TopicRouter>,
    pub authorizer: Arc<dyn TopicAuthorizer>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: HubConfig,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the hub. Returns a handle that keeps the background
/// tasks alive.
pub async fn start(
    config: HubConfig,
    authorizer: Arc<dyn TopicAuthorizer>,
    authenticator: Arc<dyn Authenticator>,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<HubHandle, std::io::Error> {
    let router = Arc::new(TopicRouter::new(metrics));

    let cleanup = start_cleanup_task(
        Arc::clone(&router),
        Duration::from_secs(config.cleanup_interval_secs),
        Duration::from_secs(config.heartbeat_timeout_secs),
    );

    let state = AppState {
        router: Arc::clone(&router),
        authorizer,
        authenticator,
        config: config.clone(),
    };

    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "relay hub started");

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok(HubHandle {
        port: local_addr.port(),
        router,
        _server: server,
        _cleanup: cleanup,
    })
}

/// Handle returned by `start()` — keeps background tasks alive. The router
/// reference lets in-process producers broadcast without a socket.
pub struct HubHandle {
    pub port: u16,
    pub router: Arc<TopicRouter>,
    _server: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler. Identity is established here, once, from the
/// `token` query parameter; it is immutable for the session's lifetime.
/// Failed authentication rejects the request before the upgrade happens.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(token) = params.get("token") else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    let Some(identity) = state.authenticator.authenticate(token).await else {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
        .into_response()
}

/// Wire a freshly upgraded socket into the router.
async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let (session, rx) = SessionHandle::new(identity, state.config.max_send_queue);
    tracing::info!(connection_id = %session.id, user_id = %session.identity.user_id, "client connected");
    state.router.register(Arc::clone(&session));

    run_session(
        socket,
        session,
        rx,
        state.router,
        state.authorizer,
        state.config,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.router.connection_count(),
    }))
}
