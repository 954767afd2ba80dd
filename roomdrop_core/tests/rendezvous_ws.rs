use futures_util::{SinkExt, StreamExt};
use roomdrop_core::rendezvous::{ClientMessage, RendezvousState, ServerMessage, serve};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (String, Arc<RendezvousState>, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(RendezvousState::new());
    let cancel = CancellationToken::new();

    let server_state = state.clone();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        serve(listener, server_state, Some(server_cancel)).await.unwrap();
    });

    (format!("ws://127.0.0.1:{}/ws", port), state, cancel)
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("Failed to connect");
    ws
}

async fn send(ws: &mut Ws, msg: ClientMessage) {
    ws.send(Message::Text(serde_json::to_string(&msg).unwrap().into()))
        .await
        .unwrap();
}

async fn next_message(ws: &mut Ws) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(msg) = ws.next().await {
            if let Ok(Message::Text(text)) = msg {
                return serde_json::from_str::<ServerMessage>(&text).unwrap();
            }
        }
        panic!("connection closed");
    })
    .await
    .expect("Timeout waiting for server message")
}

/// Poll until `check` holds or two seconds pass
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

fn room(id: &str) -> String {
    id.to_string()
}

#[tokio::test]
async fn test_third_participant_gets_room_full() {
    let (url, state, cancel) = start_server().await;

    let mut a = connect(&url).await;
    send(&mut a, ClientMessage::CreateRoom { room_id: room("4821") }).await;
    assert_eq!(
        next_message(&mut a).await,
        ServerMessage::RoomCreated { room_id: room("4821") }
    );

    let mut b = connect(&url).await;
    send(&mut b, ClientMessage::JoinRoom { room_id: room("4821") }).await;
    assert_eq!(
        next_message(&mut b).await,
        ServerMessage::RoomJoined { room_id: room("4821") }
    );
    assert!(matches!(
        next_message(&mut a).await,
        ServerMessage::OtherUserJoined { .. }
    ));

    let mut c = connect(&url).await;
    send(&mut c, ClientMessage::JoinRoom { room_id: room("4821") }).await;
    assert_eq!(
        next_message(&mut c).await,
        ServerMessage::RoomFull { room_id: room("4821") }
    );
    assert_eq!(state.registry.room_size("4821").await, Some(2));

    cancel.cancel();
}

#[tokio::test]
async fn test_relay_reaches_only_the_other_member() {
    let (url, _state, cancel) = start_server().await;

    let mut a = connect(&url).await;
    send(&mut a, ClientMessage::CreateRoom { room_id: room("r") }).await;
    next_message(&mut a).await;
    let mut b = connect(&url).await;
    send(&mut b, ClientMessage::JoinRoom { room_id: room("r") }).await;
    next_message(&mut b).await;
    next_message(&mut a).await;

    let payload = json!({"kind": "offer", "addr": "10.0.0.5:40000", "token": 1});
    send(
        &mut a,
        ClientMessage::Relay {
            room_id: room("r"),
            payload: payload.clone(),
        },
    )
    .await;

    match next_message(&mut b).await {
        ServerMessage::Relay {
            room_id,
            payload: got,
            ..
        } => {
            assert_eq!(room_id, "r");
            assert_eq!(got, payload);
        }
        other => panic!("expected relay, got {other:?}"),
    }

    // An outsider relaying into the room is ignored
    let mut outsider = connect(&url).await;
    send(
        &mut outsider,
        ClientMessage::Relay {
            room_id: room("r"),
            payload: json!({"kind": "answer"}),
        },
    )
    .await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), b.next())
            .await
            .is_err()
    );

    cancel.cancel();
}

#[tokio::test]
async fn test_leave_shrinks_then_deletes_room() {
    let (url, state, cancel) = start_server().await;

    let mut a = connect(&url).await;
    send(&mut a, ClientMessage::CreateRoom { room_id: room("9") }).await;
    next_message(&mut a).await;
    let mut b = connect(&url).await;
    send(&mut b, ClientMessage::JoinRoom { room_id: room("9") }).await;
    next_message(&mut b).await;
    next_message(&mut a).await;

    b.close(None).await.unwrap();
    assert!(matches!(
        next_message(&mut a).await,
        ServerMessage::UserDisconnected { .. }
    ));
    assert_eq!(state.registry.room_size("9").await, Some(1));

    a.close(None).await.unwrap();
    eventually(|| {
        let state = state.clone();
        async move { state.registry.room_count().await == 0 }
    })
    .await;

    let mut d = connect(&url).await;
    send(&mut d, ClientMessage::JoinRoom { room_id: room("9") }).await;
    assert_eq!(
        next_message(&mut d).await,
        ServerMessage::RoomNotFound { room_id: room("9") }
    );

    cancel.cancel();
}

#[tokio::test]
async fn test_reconnect_notifies_remaining_member() {
    let (url, _state, cancel) = start_server().await;

    let mut a = connect(&url).await;
    send(&mut a, ClientMessage::CreateRoom { room_id: room("77") }).await;
    next_message(&mut a).await;
    let mut b = connect(&url).await;
    send(&mut b, ClientMessage::JoinRoom { room_id: room("77") }).await;
    next_message(&mut b).await;
    next_message(&mut a).await;

    b.close(None).await.unwrap();
    assert!(matches!(
        next_message(&mut a).await,
        ServerMessage::UserDisconnected { .. }
    ));

    let mut b2 = connect(&url).await;
    send(&mut b2, ClientMessage::ReconnectToRoom { room_id: room("77") }).await;
    assert_eq!(
        next_message(&mut b2).await,
        ServerMessage::ReconnectedToRoom { room_id: room("77") }
    );
    assert!(matches!(
        next_message(&mut a).await,
        ServerMessage::UserReconnected { .. }
    ));

    let mut late = connect(&url).await;
    send(&mut late, ClientMessage::ReconnectToRoom { room_id: room("77") }).await;
    assert_eq!(
        next_message(&mut late).await,
        ServerMessage::ReconnectionFailed { room_id: room("77") }
    );

    cancel.cancel();
}

#[tokio::test]
async fn test_malformed_request_gets_error_reply() {
    let (url, _state, cancel) = start_server().await;

    let mut a = connect(&url).await;
    a.send(Message::Text("{\"type\":\"offer\"}".to_string().into()))
        .await
        .unwrap();
    assert!(matches!(
        next_message(&mut a).await,
        ServerMessage::Error { .. }
    ));

    cancel.cancel();
}
