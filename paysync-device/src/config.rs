//! Device agent configuration.

use paysync_core::realtime::{ChannelSettings, SupervisorSettings};
use paysync_core::{OrphanRetention, ServerEndpoint};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub storage_path: PathBuf,
    pub sync_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub orphan_expire_days: u64,
    pub orphan_purge_days: u64,
    pub backoff: BackoffConfig,
    pub heartbeat_secs: u64,
    pub network_settle_ms: u64,
    pub servers: Vec<ServerEndpoint>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            storage_path: PathBuf::from("paysync-device.db"),
            sync_interval_secs: 300,
            cleanup_interval_secs: 3600,
            orphan_expire_days: 7,
            orphan_purge_days: 30,
            backoff: BackoffConfig::default(),
            heartbeat_secs: 30,
            network_settle_ms: 2000,
            servers: Vec::new(),
        }
    }
}

impl DeviceConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device_id.trim().is_empty() {
            anyhow::bail!("device_id must be set");
        }
        if self.backoff.initial_ms == 0 || self.backoff.max_ms < self.backoff.initial_ms {
            anyhow::bail!(
                "backoff must satisfy 0 < initial_ms <= max_ms, got {} / {}",
                self.backoff.initial_ms,
                self.backoff.max_ms
            );
        }
        if self.orphan_purge_days < self.orphan_expire_days {
            anyhow::bail!("orphan_purge_days must not be shorter than orphan_expire_days");
        }
        let mut ids = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !ids.insert(server.id.as_str()) {
                anyhow::bail!("duplicate server id {:?}", server.id);
            }
        }
        Ok(())
    }

    pub fn retention(&self) -> OrphanRetention {
        OrphanRetention::from_days(self.orphan_expire_days, self.orphan_purge_days)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            channel: ChannelSettings {
                backoff_initial: Duration::from_millis(self.backoff.initial_ms),
                backoff_max: Duration::from_millis(self.backoff.max_ms),
                heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
                network_settle: Duration::from_millis(self.network_settle_ms),
                ..ChannelSettings::default()
            },
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs.max(1)),
            retention: self.retention(),
        }
    }
}
