//! Per-server connection settings and the persisted sync cursor.

use serde::{Deserialize, Serialize};

use crate::protocol::PATH_REALTIME;
use crate::{DatabaseError, PaySyncError, Result};

/// One remote server this device reconciles against.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub id: String,
    pub base_url: String,
    /// Realtime channel URL; derived from `base_url` when absent.
    #[serde(default)]
    pub ws_url: Option<String>,
    pub api_key: String,
    pub shared_secret: String,
}

impl std::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("ws_url", &self.ws_url)
            .finish_non_exhaustive()
    }
}

impl ServerEndpoint {
    /// Base URL without a trailing slash.
    pub fn normalized_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// URL of the realtime channel: the explicit `ws_url`, or `base_url` with
    /// the scheme switched to `ws`/`wss` and the realtime path appended.
    pub fn realtime_url(&self) -> Result<String> {
        if let Some(url) = &self.ws_url {
            return Ok(url.clone());
        }
        let base = self.normalized_base_url();
        let swapped = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            return Err(PaySyncError::InvalidInput(format!(
                "server {}: base_url must start with http:// or https://",
                self.id
            )));
        };
        Ok(format!("{}{}", swapped, PATH_REALTIME))
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PaySyncError::InvalidInput("server id is required".to_string()));
        }
        if self.api_key.is_empty() || self.shared_secret.is_empty() {
            return Err(PaySyncError::InvalidInput(format!(
                "server {}: api_key and shared_secret are required",
                self.id
            )));
        }
        self.realtime_url().map(|_| ())
    }
}

/// Highest approval version already merged from one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub server_id: String,
    pub last_synced_version: i64,
    pub last_sync_at_ms: Option<i64>,
}

impl SyncCursor {
    /// Load the cursor for `server_id`. Returns a zero cursor if none was saved.
    pub fn load(conn: &rusqlite::Connection, server_id: &str) -> Result<Self> {
        let result = conn.query_row(
            "SELECT last_synced_version, last_sync_at_ms FROM sync_cursors WHERE server_id = ?1",
            [server_id],
            |row| {
                Ok(SyncCursor {
                    server_id: server_id.to_string(),
                    last_synced_version: row.get(0)?,
                    last_sync_at_ms: row.get(1)?,
                })
            },
        );

        match result {
            Ok(cursor) => Ok(cursor),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Self {
                server_id: server_id.to_string(),
                ..Self::default()
            }),
            Err(e) => Err(DatabaseError::Sqlite(e).into()),
        }
    }

    /// Save the cursor (upsert).
    pub fn save(&self, conn: &rusqlite::Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO sync_cursors (server_id, last_synced_version, last_sync_at_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(server_id) DO UPDATE SET
                last_synced_version = excluded.last_synced_version,
                last_sync_at_ms = excluded.last_sync_at_ms",
            rusqlite::params![self.server_id, self.last_synced_version, self.last_sync_at_ms],
        )
        .map_err(DatabaseError::Sqlite)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;

    fn endpoint(base_url: &str) -> ServerEndpoint {
        ServerEndpoint {
            id: "shop".to_string(),
            base_url: base_url.to_string(),
            ws_url: None,
            api_key: "key".to_string(),
            shared_secret: "secret".to_string(),
        }
    }

    #[test]
    fn realtime_url_is_derived_from_base() {
        assert_eq!(
            endpoint("https://shop.example.com/").realtime_url().unwrap(),
            "wss://shop.example.com/api/v1/realtime"
        );
        assert_eq!(
            endpoint("http://127.0.0.1:8080").realtime_url().unwrap(),
            "ws://127.0.0.1:8080/api/v1/realtime"
        );
        assert!(endpoint("ftp://nope").realtime_url().is_err());
    }

    #[test]
    fn explicit_ws_url_wins() {
        let mut ep = endpoint("https://shop.example.com");
        ep.ws_url = Some("wss://push.example.com/socket".to_string());
        assert_eq!(ep.realtime_url().unwrap(), "wss://push.example.com/socket");
    }

    #[test]
    fn debug_hides_secrets() {
        let rendered = format!("{:?}", endpoint("https://shop.example.com"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn cursor_defaults_and_roundtrips() {
        let store = LocalStore::in_memory().unwrap();
        let conn = store.conn().unwrap();

        let mut cursor = SyncCursor::load(&conn, "shop").unwrap();
        assert_eq!(cursor.last_synced_version, 0);
        assert_eq!(cursor.server_id, "shop");

        cursor.last_synced_version = 42;
        cursor.last_sync_at_ms = Some(1);
        cursor.save(&conn).unwrap();

        assert_eq!(SyncCursor::load(&conn, "shop").unwrap(), cursor);
        assert_eq!(SyncCursor::load(&conn, "other").unwrap().last_synced_version, 0);
    }
}
