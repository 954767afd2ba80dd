//! WebSocket client side of the rendezvous protocol

use crate::rendezvous::{ClientMessage, ServerMessage};
use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sending half of a signaling connection
pub struct SignalingClient {
    sink: SplitSink<WsStream, Message>,
}

/// Receiving half of a signaling connection
pub struct SignalingEvents {
    stream: SplitStream<WsStream>,
}

impl SignalingClient {
    /// Open a signaling connection to the rendezvous service
    pub async fn connect(url: &Url) -> Result<(SignalingClient, SignalingEvents)> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        tracing::info!("Connected to rendezvous service at {}", url);

        let (sink, stream) = ws_stream.split();
        Ok((SignalingClient { sink }, SignalingEvents { stream }))
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.sink
            .send(Message::text(text))
            .await
            .context("Signaling send failed")
    }

    pub async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

impl SignalingEvents {
    /// Next message from the service. `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(parsed) => return Some(parsed),
                    Err(e) => tracing::warn!("Unparseable signaling message: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Signaling connection error: {}", e);
                    break;
                }
            }
        }
        None
    }
}
