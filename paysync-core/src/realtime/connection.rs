//! Per-server connection status, shared between channel tasks and callers.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConnection {
    pub server_id: String,
    pub state: ConnectionState,
    pub backoff_ms: u64,
    pub last_error: Option<String>,
    pub connected_since_ms: Option<i64>,
}

impl DeviceConnection {
    fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            state: ConnectionState::Disconnected,
            backoff_ms: 0,
            last_error: None,
            connected_since_ms: None,
        }
    }
}

/// Snapshot board of every server's connection.
#[derive(Clone, Default)]
pub struct ConnectionBoard {
    inner: Arc<RwLock<BTreeMap<String, DeviceConnection>>>,
}

impl ConnectionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, server_id: &str, f: impl FnOnce(&mut DeviceConnection)) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = map
            .entry(server_id.to_string())
            .or_insert_with(|| DeviceConnection::new(server_id));
        f(entry);
    }

    pub fn register(&self, server_id: &str) {
        self.update(server_id, |_| {});
    }

    pub fn set_state(&self, server_id: &str, state: ConnectionState) {
        self.update(server_id, |c| {
            c.state = state;
            match state {
                ConnectionState::Connected => {
                    c.connected_since_ms = Some(crate::now_ms());
                    c.backoff_ms = 0;
                    c.last_error = None;
                }
                _ => c.connected_since_ms = None,
            }
        });
    }

    pub fn set_reconnecting(&self, server_id: &str, delay: Duration) {
        self.update(server_id, |c| {
            c.state = ConnectionState::Reconnecting;
            c.backoff_ms = delay.as_millis() as u64;
            c.connected_since_ms = None;
        });
    }

    pub fn set_error(&self, server_id: &str, error: impl Into<String>) {
        let error = error.into();
        self.update(server_id, |c| c.last_error = Some(error));
    }

    pub fn get(&self, server_id: &str) -> Option<DeviceConnection> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(server_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<DeviceConnection> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_clears_error_and_backoff() {
        let board = ConnectionBoard::new();
        board.register("shop");
        assert_eq!(board.get("shop").unwrap().state, ConnectionState::Disconnected);

        board.set_error("shop", "refused");
        board.set_reconnecting("shop", Duration::from_secs(4));
        let conn = board.get("shop").unwrap();
        assert_eq!(conn.state, ConnectionState::Reconnecting);
        assert_eq!(conn.backoff_ms, 4000);
        assert_eq!(conn.last_error.as_deref(), Some("refused"));

        board.set_state("shop", ConnectionState::Connected);
        let conn = board.get("shop").unwrap();
        assert_eq!(conn.backoff_ms, 0);
        assert!(conn.last_error.is_none());
        assert!(conn.connected_since_ms.is_some());
    }

    #[test]
    fn snapshot_is_sorted_by_server() {
        let board = ConnectionBoard::new();
        board.register("b");
        board.register("a");
        let ids: Vec<_> = board.snapshot().into_iter().map(|c| c.server_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
