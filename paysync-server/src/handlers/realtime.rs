//! Realtime push hub: forwards the broadcast bus to each connected device.

use crate::auth::device_id;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use paysync_core::now_ms;
use paysync_core::protocol::ChannelFrame;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub async fn realtime(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let device_id = device_id(&headers).unwrap_or("unknown").to_string();
    let bus = state.bus.subscribe();
    let heartbeat = Duration::from_secs(state.config.heartbeat_secs.max(1));
    ws.on_upgrade(move |socket| session(socket, bus, heartbeat, device_id))
}

async fn session(
    socket: WebSocket,
    mut bus: broadcast::Receiver<ChannelFrame>,
    heartbeat: Duration,
    device_id: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();
    info!(device_id, "Realtime session opened");

    loop {
        let frame = tokio::select! {
            msg = bus.recv() => match msg {
                Ok(frame) => frame,
                // Frames were dropped; have the device pull instead
                Err(RecvError::Lagged(skipped)) => {
                    warn!(device_id, skipped, "Realtime subscriber lagged");
                    ChannelFrame::new(ChannelFrame::SYNC_REQUEST, serde_json::Value::Null)
                }
                Err(RecvError::Closed) => break,
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ChannelFrame>(text.as_str()) {
                        Ok(frame) if frame.kind == ChannelFrame::PING => ChannelFrame::ping(now_ms()),
                        Ok(frame) => {
                            debug!(device_id, kind = %frame.kind, "Ignoring device frame");
                            continue;
                        }
                        Err(e) => {
                            debug!(device_id, error = %e, "Malformed device frame");
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(device_id, error = %e, "Realtime receive failed");
                    break;
                }
            },
            _ = ticker.tick() => ChannelFrame::ping(now_ms()),
        };

        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode realtime frame");
                continue;
            }
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }

    info!(device_id, "Realtime session closed");
}
