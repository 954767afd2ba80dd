//! Direct channel establishment over TCP.
//!
//! The room creator listens and relays an `offer` carrying its address and a
//! one-time token. The joiner connects, writes the token, and relays an
//! `answer`. Connections that do not present the token are dropped.

use crate::config::ClientConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Setup messages carried inside rendezvous `relay` payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SetupPayload {
    Offer { addr: String, token: u64 },
    Answer,
}

impl SetupPayload {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).context("Malformed setup payload")
    }
}

/// Listener waiting for the joiner to connect
pub struct PendingOffer {
    listener: TcpListener,
    token: u64,
    advertised: String,
}

impl PendingOffer {
    /// Bind the direct-channel listener described by `config`
    pub async fn bind(config: &ClientConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.direct_bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.direct_bind))?;
        let port = listener.local_addr()?.port();
        let advertised = format!("{}:{}", config.advertised_host(), port);

        Ok(Self {
            listener,
            token: rand::random(),
            advertised,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn payload(&self) -> SetupPayload {
        SetupPayload::Offer {
            addr: self.advertised.clone(),
            token: self.token,
        }
    }

    /// Accept the first connection that presents the offer's token
    pub async fn accept(self, timeout: Duration) -> Result<TcpStream> {
        tokio::time::timeout(timeout, async {
            loop {
                let (mut stream, peer) = self.listener.accept().await?;
                let presented = tokio::time::timeout(Duration::from_secs(5), stream.read_u64()).await;
                match presented {
                    Ok(Ok(token)) if token == self.token => {
                        stream.set_nodelay(true)?;
                        tracing::info!("Direct channel accepted from {}", peer);
                        return Ok::<_, anyhow::Error>(stream);
                    }
                    _ => tracing::warn!("Dropping direct connection from {}: bad token", peer),
                }
            }
        })
        .await
        .map_err(|_| anyhow!("No peer connected within {:?}", timeout))?
    }
}

/// Connect to an offered address and present its token
pub async fn connect_to_offer(addr: &str, token: u64, timeout: Duration) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("Connecting to {} timed out", addr))?
        .with_context(|| format!("Failed to connect to {}", addr))?;
    stream.set_nodelay(true)?;
    stream.write_u64(token).await?;
    stream.flush().await?;
    tracing::info!("Direct channel connected to {}", addr);
    Ok(stream)
}
