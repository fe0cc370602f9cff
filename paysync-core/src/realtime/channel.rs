//! Persistent WebSocket channel to one server.
//!
//! State machine: DISCONNECTED → CONNECTING → CONNECTED, and on any failure
//! or close back to DISCONNECTED followed by RECONNECTING with exponential
//! backoff. The backoff resets on every successful connect. While the network
//! is down no reconnect timer runs; when it comes back the channel waits a
//! short settle delay and reconnects immediately.

use super::backoff::Backoff;
use super::connection::{ConnectionBoard, ConnectionState};
use super::message::{ChannelEvent, EventSink};
use crate::protocol::{ChannelFrame, HEADER_API_KEY, HEADER_DEVICE_ID};
use crate::sync::ServerEndpoint;
use crate::{now_ms, PaySyncError, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub heartbeat: Duration,
    pub network_settle: Duration,
    pub connect_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            heartbeat: Duration::from_secs(30),
            network_settle: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

enum SessionEnd {
    Cancelled,
    NetworkDown,
    Closed(Option<String>),
}

enum Wake {
    Cancelled,
    Elapsed,
    NetworkUp,
    NetworkDown,
}

pub struct RealtimeChannel {
    server_id: String,
    url: String,
    api_key: String,
    device_id: String,
    sink: Arc<dyn EventSink>,
    board: ConnectionBoard,
    settings: ChannelSettings,
}

impl RealtimeChannel {
    pub fn new(
        endpoint: &ServerEndpoint,
        device_id: &str,
        sink: Arc<dyn EventSink>,
        board: ConnectionBoard,
        settings: ChannelSettings,
    ) -> Result<Self> {
        Ok(Self {
            server_id: endpoint.id.clone(),
            url: endpoint.realtime_url()?,
            api_key: endpoint.api_key.clone(),
            device_id: device_id.to_string(),
            sink,
            board,
            settings,
        })
    }

    /// Run until `cancel` fires. `network` carries whether the device has
    /// connectivity.
    pub async fn run(self, cancel: CancellationToken, mut network: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);
        self.board.register(&self.server_id);
        info!(server = %self.server_id, url = %self.url, "Realtime channel started");

        'outer: loop {
            if !*network.borrow() {
                self.board.set_state(&self.server_id, ConnectionState::Disconnected);
                debug!(server = %self.server_id, "Network down, waiting");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        changed = network.changed() => {
                            if changed.is_err() {
                                break 'outer;
                            }
                            if *network.borrow() {
                                break;
                            }
                        }
                    }
                }
                backoff.reset();
                match self.wait(self.settings.network_settle, &cancel, &mut network).await {
                    Wake::Cancelled => break 'outer,
                    Wake::NetworkDown => continue 'outer,
                    Wake::Elapsed | Wake::NetworkUp => {}
                }
            }

            self.board.set_state(&self.server_id, ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                res = tokio::time::timeout(self.settings.connect_timeout, self.connect()) => {
                    res.unwrap_or_else(|_| Err(PaySyncError::Network("connect timed out".into())))
                }
            };

            match attempt {
                Ok(ws) => {
                    self.board.set_state(&self.server_id, ConnectionState::Connected);
                    backoff.reset();
                    info!(server = %self.server_id, "Realtime channel connected");

                    match self.session(ws, &cancel, &mut network).await {
                        SessionEnd::Cancelled => break 'outer,
                        SessionEnd::NetworkDown => {
                            info!(server = %self.server_id, "Network lost, channel closed");
                            continue 'outer;
                        }
                        SessionEnd::Closed(reason) => {
                            if let Some(reason) = reason {
                                warn!(server = %self.server_id, error = %reason, "Realtime channel dropped");
                                self.board.set_error(&self.server_id, reason);
                            } else {
                                info!(server = %self.server_id, "Realtime channel closed by server");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(server = %self.server_id, error = %e, "Realtime connect failed");
                    self.board.set_error(&self.server_id, e.to_string());
                }
            }

            self.board.set_state(&self.server_id, ConnectionState::Disconnected);
            let delay = backoff.next_delay();
            self.board.set_reconnecting(&self.server_id, delay);
            debug!(server = %self.server_id, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            match self.wait(delay, &cancel, &mut network).await {
                Wake::Cancelled => break 'outer,
                Wake::Elapsed | Wake::NetworkDown => {}
                Wake::NetworkUp => {
                    backoff.reset();
                    if let Wake::Cancelled =
                        self.wait(self.settings.network_settle, &cancel, &mut network).await
                    {
                        break 'outer;
                    }
                }
            }
        }

        self.board.set_state(&self.server_id, ConnectionState::Disconnected);
        info!(server = %self.server_id, "Realtime channel stopped");
    }

    /// Sleep for `delay`, cut short by cancellation or a network change.
    async fn wait(
        &self,
        delay: Duration,
        cancel: &CancellationToken,
        network: &mut watch::Receiver<bool>,
    ) -> Wake {
        tokio::select! {
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = tokio::time::sleep(delay) => Wake::Elapsed,
            changed = network.changed() => {
                if changed.is_err() {
                    Wake::Cancelled
                } else if *network.borrow() {
                    Wake::NetworkUp
                } else {
                    Wake::NetworkDown
                }
            }
        }
    }

    async fn connect(&self) -> Result<WsStream> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| PaySyncError::InvalidInput(format!("bad realtime url: {}", e)))?;

        let headers = request.headers_mut();
        for (name, value) in [
            (HEADER_API_KEY, self.api_key.as_str()),
            (HEADER_DEVICE_ID, self.device_id.as_str()),
        ] {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PaySyncError::InvalidInput(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PaySyncError::InvalidInput(e.to_string()))?;
            headers.insert(name, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| PaySyncError::Network(e.to_string()))?;
        Ok(ws)
    }

    async fn session(
        &self,
        ws: WsStream,
        cancel: &CancellationToken,
        network: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                changed = network.changed() => {
                    if changed.is_err() {
                        let _ = write.close().await;
                        return SessionEnd::Cancelled;
                    }
                    if !*network.borrow() {
                        let _ = write.close().await;
                        return SessionEnd::NetworkDown;
                    }
                }
                _ = heartbeat.tick() => {
                    let Ok(frame) = serde_json::to_string(&ChannelFrame::ping(now_ms())) else {
                        continue;
                    };
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        return SessionEnd::Closed(Some(e.to_string()));
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed(None),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Closed(Some(e.to_string())),
                },
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        match ChannelEvent::parse(text) {
            None => debug!(server = %self.server_id, "Ignoring malformed frame"),
            Some(ChannelEvent::Ping(_)) => debug!(server = %self.server_id, "Server ping"),
            Some(ChannelEvent::Unknown(kind)) => {
                debug!(server = %self.server_id, kind = %kind, "Ignoring unknown message type")
            }
            Some(event) => {
                debug!(server = %self.server_id, ?event, "Dispatching realtime event");
                self.sink.on_event(event).await;
            }
        }
    }
}
