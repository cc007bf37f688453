use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::Method,
    response::Response,
    routing::get,
    Json, Router,
};
use parlor_shared::envelope::now_secs;
use parlor_shared::UserId;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::hub::HubHandle;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let client_page = ServeFile::new(&state.config.client_page);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route_service("/", client_page.clone())
        .route_service("/client.html", client_page)
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct ConnectParams {
    #[serde(rename = "userID")]
    user_id: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct StatsResponse {
    clients: usize,
    users: Vec<UserId>,
    version: &'static str,
    timestamp: i64,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let users: Vec<UserId> = state
        .hub
        .members()
        .await
        .into_iter()
        .map(|(_, user_id)| user_id)
        .collect();

    Json(StatsResponse {
        clients: users.len(),
        users,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now_secs(),
    })
}

async fn not_found() -> ServerError {
    ServerError::NotFound
}

/// Identity for a new connection: the client's hint if it has one.
fn resolve_user_id(hint: Option<&str>) -> Result<UserId, ServerError> {
    let hinted = match hint {
        Some(hint) => UserId::from_hint(hint)?,
        None => None,
    };
    Ok(hinted.unwrap_or_else(UserId::generate))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let user_id = resolve_user_id(params.user_id.as_deref())?;
    let max_frame_size = state.config.max_frame_size;

    info!(peer = %addr, user = %user_id, "New WebSocket connection");

    Ok(ws
        .max_message_size(max_frame_size)
        .max_frame_size(max_frame_size)
        .on_failed_upgrade(move |e| warn!(peer = %addr, error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| accept(socket, state, user_id)))
}

async fn accept(socket: WebSocket, state: AppState, user_id: UserId) {
    let registered = Connection::register(
        state.hub.clone(),
        user_id,
        state.config.max_frame_size,
        state.config.timing,
    )
    .await;

    match registered {
        Ok((connection, outbound)) => {
            debug!(
                conn = %connection.id(),
                user = %connection.user_id(),
                "Registered with hub, starting pumps"
            );
            connection.run(socket, outbound).await;
        }
        Err(e) => error!(error = %e, "Could not register connection"),
    }
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
