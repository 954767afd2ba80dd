//! Rendezvous HTTP/WebSocket server

use super::handler::{self, MAX_MESSAGE_SIZE};
use super::registry::RoomRegistry;
use anyhow::Result;
use axum::{
    Json, Router,
    extract::{ConnectInfo, State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    routing::get,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared server state
#[derive(Default)]
pub struct RendezvousState {
    pub registry: RoomRegistry,
    pub connection_count: AtomicUsize,
}

impl RendezvousState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    rooms: usize,
    connections: usize,
}

async fn health_handler(State(state): State<Arc<RendezvousState>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        rooms: state.registry.room_count().await,
        connections: state.connection_count.load(Ordering::SeqCst),
    })
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// WebSocket upgrade handler
async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RendezvousState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let ip = addr.ip().to_string();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handler::handle_socket(socket, state, ip))
}

/// Build the rendezvous router
pub fn create_router(state: Arc<RendezvousState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

/// Serve the rendezvous router on an already bound listener
pub async fn serve(
    listener: TcpListener,
    state: Arc<RendezvousState>,
    cancel_token: Option<CancellationToken>,
) -> Result<()> {
    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    if let Some(ct) = cancel_token {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                ct.cancelled().await;
                tracing::info!("Rendezvous server shutting down gracefully");
            })
            .await?;
    } else {
        axum::serve(listener, app).await?;
    }

    Ok(())
}

/// Bind `addr` and run the rendezvous service until cancelled
pub async fn start_server(addr: SocketAddr, cancel_token: Option<CancellationToken>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Rendezvous server listening on ws://{}/ws", listener.local_addr()?);
    serve(listener, Arc::new(RendezvousState::new()), cancel_token).await
}
