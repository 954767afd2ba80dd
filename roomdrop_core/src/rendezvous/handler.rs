//! Per-connection WebSocket handler

use super::messages::{ClientMessage, ServerMessage};
use super::registry::MemberHandle;
use super::server::RendezvousState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Ping interval for keeping idle signaling connections alive
const PING_INTERVAL_SECS: u64 = 15;

/// Maximum concurrent signaling connections
pub const MAX_CONNECTIONS: usize = 1024;

/// Largest accepted signaling message (setup payloads are small)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Guard for the active connection count
pub struct ConnectionGuard {
    state: Arc<RendezvousState>,
}

impl ConnectionGuard {
    /// Take a connection slot, or `None` when the limit is reached
    pub fn acquire(state: Arc<RendezvousState>) -> Option<Self> {
        state
            .connection_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < MAX_CONNECTIONS).then_some(current + 1)
            })
            .ok()
            .map(|_| Self { state })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.connection_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drive one participant connection until it closes, then remove the
/// participant from its room.
pub async fn handle_socket(socket: WebSocket, state: Arc<RendezvousState>, client_ip: String) {
    let (mut sender, mut receiver) = socket.split();

    let Some(_guard) = ConnectionGuard::acquire(state.clone()) else {
        tracing::warn!("Rejecting signaling connection from {}: too many connections", client_ip);
        let reply = ServerMessage::Error {
            message: "Too many concurrent connections".to_string(),
        };
        let _ = sender.send(Message::Text(reply.to_json().into())).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    let member_id = Uuid::new_v4().to_string();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let member = MemberHandle::new(member_id.clone(), outbox_tx);
    tracing::info!("Participant {} connected from {}", member_id, client_ip);

    let mut ping_interval =
        tokio::time::interval(tokio::time::Duration::from_secs(PING_INTERVAL_SECS));
    ping_interval.tick().await;

    loop {
        tokio::select! {
            Some(outgoing) = outbox_rx.recv() => {
                if let Err(e) = sender.send(Message::Text(outgoing.to_json().into())).await {
                    tracing::debug!("Send to {} failed: {}", member_id, e);
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(bytes::Bytes::new())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&state, &member, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        member.notify(ServerMessage::Error {
                            message: "Binary messages are not supported".to_string(),
                        });
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error from {}: {}", member_id, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.registry.leave(&member_id).await;
    tracing::info!("Participant {} disconnected", member_id);
}

/// Apply one client request to the registry
async fn dispatch(state: &RendezvousState, member: &MemberHandle, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!("Malformed message from {}: {}", member.id(), e);
            member.notify(ServerMessage::Error {
                message: format!("Malformed message: {e}"),
            });
            return;
        }
    };

    // Refusals are already reported to the member by the registry
    match msg {
        ClientMessage::CreateRoom { room_id } => {
            let _ = state.registry.create(&room_id, member.clone()).await;
        }
        ClientMessage::JoinRoom { room_id } => {
            let _ = state.registry.join(&room_id, member.clone()).await;
        }
        ClientMessage::ReconnectToRoom { room_id } => {
            let _ = state.registry.reconnect(&room_id, member.clone()).await;
        }
        ClientMessage::Relay { room_id, payload } => {
            state.registry.relay(&room_id, member.id(), payload).await;
        }
    }
}
