//! HTTP client for one reconciliation server.

use crate::envelope::SecureEnvelope;
use crate::models::Transaction;
use crate::protocol::{
    approve_path, reject_path, ActionResponse, ApproveRequest, NotifyRequest, NotifyResponse,
    RejectRequest, SyncPullData, SyncPullResponse, HEADER_API_KEY, HEADER_DEVICE_ID,
    HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP, PATH_NOTIFY, PATH_ORDERS_SYNC,
};
use crate::sync::config::ServerEndpoint;
use crate::{PaySyncError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// The calls the sync engine makes against a server.
#[async_trait]
pub trait ServerApi: Send + Sync {
    fn server_id(&self) -> &str;

    /// Seal and submit an observed transaction.
    async fn submit_transaction(&self, tx: &Transaction) -> Result<NotifyResponse>;

    /// Approvals with `synced_version > since_version`, ascending, at most `limit`.
    async fn pull(&self, since_version: i64, limit: u32) -> Result<SyncPullData>;

    async fn approve(&self, approval_id: i64, request: &ApproveRequest) -> Result<ActionResponse>;

    async fn reject(&self, approval_id: i64, reason: &str) -> Result<ActionResponse>;
}

/// `ServerApi` over HTTPS with the secure envelope.
pub struct HttpServerClient {
    client: reqwest::Client,
    endpoint: ServerEndpoint,
    device_id: String,
    envelope: SecureEnvelope,
}

impl HttpServerClient {
    pub fn new(endpoint: ServerEndpoint, device_id: &str) -> Result<Self> {
        endpoint.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PaySyncError::Network(e.to_string()))?;

        let envelope = SecureEnvelope::new(&endpoint.shared_secret);
        Ok(Self {
            client,
            endpoint,
            device_id: device_id.to_string(),
            envelope,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.normalized_base_url(), path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header(HEADER_API_KEY, &self.endpoint.api_key)
            .header(HEADER_DEVICE_ID, &self.device_id)
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PaySyncError::Network(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            return Err(PaySyncError::Server {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| PaySyncError::InvalidInput(format!("Invalid server response: {}", e)))
    }
}

#[async_trait]
impl ServerApi for HttpServerClient {
    fn server_id(&self) -> &str {
        &self.endpoint.id
    }

    async fn submit_transaction(&self, tx: &Transaction) -> Result<NotifyResponse> {
        let sealed = self.envelope.seal_transaction(tx)?;
        let body = NotifyRequest { data: sealed.data };

        let resp = self
            .authed(self.client.post(self.url(PATH_NOTIFY)))
            .header(HEADER_SIGNATURE, sealed.signature)
            .header(HEADER_NONCE, sealed.nonce)
            .header(HEADER_TIMESTAMP, sealed.timestamp_ms.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| PaySyncError::Network(e.to_string()))?;

        Self::read_json(resp).await
    }

    async fn pull(&self, since_version: i64, limit: u32) -> Result<SyncPullData> {
        let resp = self
            .authed(self.client.get(self.url(PATH_ORDERS_SYNC)))
            .query(&[
                ("since_version", since_version.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| PaySyncError::Network(e.to_string()))?;

        let body: SyncPullResponse = Self::read_json(resp).await?;
        Ok(body.data)
    }

    async fn approve(&self, approval_id: i64, request: &ApproveRequest) -> Result<ActionResponse> {
        let resp = self
            .authed(self.client.post(self.url(&approve_path(approval_id))))
            .json(request)
            .send()
            .await
            .map_err(|e| PaySyncError::Network(e.to_string()))?;

        Self::read_json(resp).await
    }

    async fn reject(&self, approval_id: i64, reason: &str) -> Result<ActionResponse> {
        let body = RejectRequest {
            reason: reason.to_string(),
        };
        let resp = self
            .authed(self.client.post(self.url(&reject_path(approval_id))))
            .json(&body)
            .send()
            .await
            .map_err(|e| PaySyncError::Network(e.to_string()))?;

        Self::read_json(resp).await
    }
}
