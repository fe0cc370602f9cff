//! Server configuration.

use paysync_core::models::ApprovalMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub storage_path: PathBuf,
    pub max_payload_size: usize,
    pub api_key: String,
    pub shared_secret: String,
    pub timestamp_tolerance_ms: i64,
    pub approval_mode: ApprovalMode,
    pub max_suffix: u8,
    pub default_expiry_minutes: i64,
    pub sync_page_limit: u32,
    pub nonce_retention_secs: i64,
    pub cleanup_interval_secs: u64,
    pub rate_limit_per_minute: u32,
    pub heartbeat_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8744".to_string(),
            storage_path: PathBuf::from("paysync.db"),
            max_payload_size: 65_536,
            api_key: String::new(),
            shared_secret: String::new(),
            timestamp_tolerance_ms: 300_000,
            approval_mode: ApprovalMode::Auto,
            max_suffix: 99,
            default_expiry_minutes: 30,
            sync_page_limit: 100,
            nonce_retention_secs: 900,
            cleanup_interval_secs: 3600,
            rate_limit_per_minute: 120,
            heartbeat_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.is_empty() {
            anyhow::bail!("api_key must be set");
        }
        if self.shared_secret.is_empty() {
            anyhow::bail!("shared_secret must be set");
        }
        if !(1..=99).contains(&self.max_suffix) {
            anyhow::bail!("max_suffix must be within 1..=99, got {}", self.max_suffix);
        }
        if self.default_expiry_minutes <= 0 {
            anyhow::bail!("default_expiry_minutes must be positive");
        }
        // Nonces must outlive the freshness window or a replay could slip in
        // after its nonce was pruned.
        if self.nonce_retention_secs * 1000 <= self.timestamp_tolerance_ms {
            anyhow::bail!(
                "nonce_retention_secs ({}) must exceed the timestamp tolerance ({} ms)",
                self.nonce_retention_secs,
                self.timestamp_tolerance_ms
            );
        }
        Ok(())
    }

    /// Sync page size, never above the protocol maximum.
    pub fn page_limit(&self) -> u32 {
        self.sync_page_limit
            .clamp(1, paysync_core::protocol::MAX_SYNC_PAGE)
    }
}
