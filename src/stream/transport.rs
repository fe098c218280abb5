//! Physical transport.
//!
//! A [`Connector`] opens one link and hands back two channels: frames to
//! write and events read off the wire. The WebSocket implementation splits the
//! socket into a writer task and a reader task so sends never block callers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};
use tracing::{debug, info, warn};

use super::connection::ABNORMAL_CLOSURE;

/// Close code reported when the peer sent a close frame without a status
const NO_STATUS_RECEIVED: u16 = 1005;

/// Frame queued for the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Something that happened on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    /// Read error. A `Closed` event always follows.
    Error(String),
    Closed { code: u16, reason: String },
}

pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outgoing>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Link>;
}

/// tokio-tungstenite connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    ws_config: WebSocketConfig,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            ws_config: WebSocketConfig {
                max_message_size: Some(16 * 1024 * 1024),
                max_frame_size: Some(4 * 1024 * 1024),
                accept_unmasked_frames: false,
                ..Default::default()
            },
        }
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link> {
        let request = endpoint
            .into_client_request()
            .context("Failed to build websocket request")?;

        debug!(endpoint, "connecting to feed websocket");
        let (ws_stream, response) = connect_async_with_config(request, Some(self.ws_config), false)
            .await
            .context("Failed to connect to feed websocket")?;

        info!(status = %response.status(), "feed websocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let result = match frame {
                    Outgoing::Text(text) => write.send(Message::Text(text)).await,
                    Outgoing::Pong(payload) => write.send(Message::Pong(payload)).await,
                    Outgoing::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!(error = %e, "close frame not delivered");
                        }
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "feed websocket write failed");
                    break;
                }
            }
        });

        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(TransportEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Outgoing::Pong(payload));
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                        debug!(code, reason = %reason, "feed websocket closed by server");
                        let _ = in_tx.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Ok(Message::Binary(data)) => {
                        warn!(bytes = data.len(), "unexpected binary frame from feed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let _ = in_tx.send(TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: "stream ended".to_string(),
            });
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
