//! Socket.IO link over a WebSocket

use super::packet::{self, EnginePacket, SocketPacket};
use super::traits::{Connector, Link, OutboundFrame, SocketEvent};
use crate::config::ClientConfig;
use crate::error::{ConnectionError, Error, ProtocolError, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the chat server's Socket.IO endpoint over a WebSocket
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: Url, handshake_timeout: Duration) -> Self {
        Self {
            url,
            handshake_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self::new(config.socket_url()?, config.handshake_timeout()))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Open the WebSocket and run the Engine.IO + Socket.IO handshake
    async fn handshake(&self, token: &str) -> Result<(String, Duration, WsStream)> {
        debug!("Opening socket: {}", self.url);

        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;

        // Engine.IO open packet comes first.
        let open = loop {
            match next_packet(&mut ws).await? {
                EnginePacket::Open(info) => break info,
                EnginePacket::Noop => continue,
                other => {
                    return Err(ProtocolError::UnexpectedPacket(format!(
                        "expected open packet, got {:?}",
                        other
                    ))
                    .into())
                }
            }
        };
        trace!("Engine.IO session {} (ping {}ms)", open.sid, open.ping_interval);

        let auth = serde_json::json!({ "token": token });
        ws.send(WsMessage::Text(packet::encode_connect(&auth).into()))
            .await?;

        loop {
            match next_packet(&mut ws).await? {
                EnginePacket::Message(SocketPacket::Connect { payload, .. }) => {
                    let sid = payload
                        .as_ref()
                        .and_then(|p| p.get("sid"))
                        .and_then(|v| v.as_str())
                        .unwrap_or(&open.sid)
                        .to_string();
                    // Silence longer than one ping cycle means the link is gone.
                    let liveness =
                        Duration::from_millis(open.ping_interval.saturating_add(open.ping_timeout));
                    return Ok((sid, liveness, ws));
                }
                EnginePacket::Message(SocketPacket::ConnectError { message, .. }) => {
                    return Err(Error::Authentication(message));
                }
                EnginePacket::Ping => {
                    ws.send(WsMessage::Text(packet::PONG.into())).await?;
                }
                EnginePacket::Close => {
                    return Err(ConnectionError::ConnectFailed(
                        "server closed during handshake".to_string(),
                    )
                    .into());
                }
                other => {
                    trace!("Ignoring packet during handshake: {:?}", other);
                }
            }
        }
    }

    /// Background task writing queued frames to the socket
    async fn write_task(
        mut sink: SplitSink<WsStream, WsMessage>,
        mut rx: mpsc::Receiver<OutboundFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            let text = match &frame {
                OutboundFrame::Emit { event, data } => packet::encode_event(event, data),
                OutboundFrame::Pong => packet::PONG.to_string(),
                OutboundFrame::Close => packet::encode_disconnect(),
            };
            trace!("Sending frame: {}", text);

            if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                error!("Failed to write socket frame: {}", e);
                break;
            }
            if frame == OutboundFrame::Close {
                let _ = sink.close().await;
                break;
            }
        }
        debug!("Socket writer task ended");
    }

    /// Background task reading frames, answering pings and forwarding events
    async fn read_task(
        mut stream: SplitStream<WsStream>,
        events: mpsc::Sender<SocketEvent>,
        pongs: mpsc::Sender<OutboundFrame>,
        liveness: Duration,
    ) {
        let reason = loop {
            let msg = match tokio::time::timeout(liveness, stream.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => break format!("socket error: {}", e),
                Ok(None) => break "socket closed".to_string(),
                Err(_) => {
                    warn!("No frame from server within {:?}", liveness);
                    break "ping timeout".to_string();
                }
            };

            let text = match msg {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Close(frame) => {
                    break frame
                        .map(|f| format!("closed by server: {}", &*f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                // tungstenite answers WebSocket-level pings itself.
                _ => continue,
            };
            trace!("Socket frame: {}", text);

            match packet::decode(&text) {
                Ok(EnginePacket::Ping) => {
                    if pongs.send(OutboundFrame::Pong).await.is_err() {
                        break "writer stopped".to_string();
                    }
                }
                Ok(EnginePacket::Message(SocketPacket::Event { name, data, .. })) => {
                    debug!("Received event: {}", name);
                    if events.send(SocketEvent::Event { name, data }).await.is_err() {
                        debug!("Event receiver dropped");
                        return;
                    }
                }
                Ok(EnginePacket::Message(SocketPacket::Disconnect { .. })) => {
                    break "server disconnected the namespace".to_string();
                }
                Ok(EnginePacket::Close) => break "engine closed".to_string(),
                Ok(other) => trace!("Ignoring packet: {:?}", other),
                Err(e) => warn!("Skipping malformed frame ({}): {}", e, text),
            }
        };

        info!("Socket link ended: {}", reason);
        let _ = events.send(SocketEvent::Closed { reason }).await;
    }
}

async fn next_packet(ws: &mut WsStream) -> Result<EnginePacket> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => return packet::decode(text.as_str()),
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ConnectionError::ConnectFailed(
                    "socket closed during handshake".to_string(),
                )
                .into())
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &str) -> Result<Link> {
        let (sid, liveness, ws) = tokio::time::timeout(self.handshake_timeout, self.handshake(token))
            .await
            .map_err(|_| Error::Connection(ConnectionError::HandshakeTimeout))??;

        info!("Socket connected: {}", sid);

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(100);
        let (in_tx, in_rx) = mpsc::channel::<SocketEvent>(256);

        let write_task = tokio::spawn(Self::write_task(sink, out_rx));
        let read_task = tokio::spawn(Self::read_task(stream, in_tx, out_tx.clone(), liveness));

        Ok(Link::new(sid, out_tx, in_rx).with_tasks(vec![write_task, read_task]))
    }
}
