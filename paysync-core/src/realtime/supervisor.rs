//! Top-level orchestration of every server connection.
//!
//! One channel task per server, one periodic full-sync backstop that runs
//! regardless of channel health, and one orphan cleanup worker, all under a
//! single cancellation root.

use super::channel::{ChannelSettings, RealtimeChannel};
use super::connection::{ConnectionBoard, DeviceConnection};
use super::message::EventSink;
use crate::orphan::{OrphanRetention, OrphanStore};
use crate::store::LocalStore;
use crate::sync::{HttpServerClient, ServerApi, ServerEndpoint, SyncEngine, SyncReport};
use crate::{now_ms, PaySyncError, Result};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Every configured server with its sync engine. Built once at startup and
/// shared by handle.
pub struct ServerRegistry {
    endpoints: BTreeMap<String, ServerEndpoint>,
    engines: BTreeMap<String, Arc<SyncEngine>>,
    store: LocalStore,
    orphans: OrphanStore,
}

impl ServerRegistry {
    pub fn new(store: LocalStore) -> Self {
        Self {
            endpoints: BTreeMap::new(),
            engines: BTreeMap::new(),
            orphans: OrphanStore::new(store.clone()),
            store,
        }
    }

    /// Registry with an HTTP client per endpoint.
    pub fn from_endpoints(
        endpoints: Vec<ServerEndpoint>,
        device_id: &str,
        store: LocalStore,
    ) -> Result<Self> {
        let mut registry = Self::new(store);
        for endpoint in endpoints {
            let api = Arc::new(HttpServerClient::new(endpoint.clone(), device_id)?);
            registry.register(endpoint, api)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, endpoint: ServerEndpoint, api: Arc<dyn ServerApi>) -> Result<()> {
        if self.endpoints.contains_key(&endpoint.id) {
            return Err(PaySyncError::InvalidInput(format!(
                "duplicate server id {:?}",
                endpoint.id
            )));
        }
        let engine = Arc::new(SyncEngine::new(api, self.store.clone()));
        self.engines.insert(endpoint.id.clone(), engine);
        self.endpoints.insert(endpoint.id.clone(), endpoint);
        Ok(())
    }

    pub fn engine(&self, server_id: &str) -> Option<Arc<SyncEngine>> {
        self.engines.get(server_id).cloned()
    }

    pub fn engines(&self) -> impl Iterator<Item = &Arc<SyncEngine>> {
        self.engines.values()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &ServerEndpoint> {
        self.endpoints.values()
    }

    pub fn orphans(&self) -> &OrphanStore {
        &self.orphans
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Run one sync cycle against every server concurrently.
    pub async fn sync_all(&self) -> Vec<(String, Result<SyncReport>)> {
        let cycles = self.engines.iter().map(|(id, engine)| async move {
            (id.clone(), engine.sync_cycle().await)
        });
        join_all(cycles).await
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub channel: ChannelSettings,
    pub sync_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention: OrphanRetention,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            channel: ChannelSettings::default(),
            sync_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
            retention: OrphanRetention::default(),
        }
    }
}

pub struct RealtimeSupervisor {
    registry: Arc<ServerRegistry>,
    board: ConnectionBoard,
    cancel: CancellationToken,
    network: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl RealtimeSupervisor {
    /// Spawn every worker. Must be called inside a tokio runtime.
    pub fn start(
        registry: Arc<ServerRegistry>,
        device_id: &str,
        settings: SupervisorSettings,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let board = ConnectionBoard::new();
        let (network, network_rx) = watch::channel(true);
        let mut tasks = JoinSet::new();

        for endpoint in registry.endpoints() {
            let Some(engine) = registry.engine(&endpoint.id) else {
                continue;
            };
            let sink: Arc<dyn EventSink> = engine;
            let channel = RealtimeChannel::new(
                endpoint,
                device_id,
                sink,
                board.clone(),
                settings.channel.clone(),
            )?;
            tasks.spawn(channel.run(cancel.child_token(), network_rx.clone()));
        }

        tasks.spawn(backstop_sync(
            registry.clone(),
            settings.sync_interval,
            cancel.child_token(),
        ));
        tasks.spawn(orphan_cleanup(
            registry.orphans().clone(),
            settings.retention,
            settings.cleanup_interval,
            cancel.child_token(),
        ));

        info!(servers = registry.engines.len(), "Realtime supervisor started");
        Ok(Self {
            registry,
            board,
            cancel,
            network,
            tasks,
        })
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Signal a connectivity change. Down cancels pending reconnects and
    /// closes live channels; up reconnects every server after a settle delay.
    pub fn set_network_available(&self, available: bool) {
        let changed = self.network.send_if_modified(|current| {
            if *current == available {
                false
            } else {
                *current = available;
                true
            }
        });
        if changed {
            info!(available, "Network state changed");
        }
    }

    pub fn connection_states(&self) -> Vec<DeviceConnection> {
        self.board.snapshot()
    }

    /// A token cancelled when the supervisor shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Cancel every worker and wait for all of them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Supervisor task failed");
            }
        }
        info!("Realtime supervisor stopped");
    }
}

async fn backstop_sync(registry: Arc<ServerRegistry>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let results = tokio::select! {
                    _ = cancel.cancelled() => break,
                    results = registry.sync_all() => results,
                };
                for (server_id, result) in results {
                    if let Err(e) = result {
                        warn!(server = %server_id, error = %e, "Backstop sync failed");
                    }
                }
            }
        }
    }
}

async fn orphan_cleanup(
    orphans: OrphanStore,
    retention: OrphanRetention,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = orphans.cleanup(retention, now_ms()) {
                    error!(error = %e, "Orphan cleanup failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ConnectionState;
    use crate::sync::engine::tests::FakeServer;

    fn dead_endpoint(id: &str) -> ServerEndpoint {
        ServerEndpoint {
            id: id.into(),
            // Nothing listens on the discard port
            base_url: "http://127.0.0.1:9".into(),
            ws_url: None,
            api_key: "key".into(),
            shared_secret: "secret".into(),
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            channel: ChannelSettings {
                backoff_initial: Duration::from_millis(20),
                backoff_max: Duration::from_millis(40),
                heartbeat: Duration::from_millis(50),
                network_settle: Duration::from_millis(10),
                connect_timeout: Duration::from_millis(500),
            },
            sync_interval: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(50),
            retention: OrphanRetention::default(),
        }
    }

    #[test]
    fn duplicate_server_ids_are_rejected() {
        let mut registry = ServerRegistry::new(LocalStore::in_memory().unwrap());
        registry
            .register(dead_endpoint("shop"), FakeServer::new("shop"))
            .unwrap();
        assert!(registry
            .register(dead_endpoint("shop"), FakeServer::new("shop"))
            .is_err());
    }

    #[tokio::test]
    async fn backstop_syncs_even_when_channels_are_down() {
        let a = FakeServer::new("a");
        let b = FakeServer::new("b");
        a.add_order("10.00", None, 1);
        b.add_order("20.00", None, 1);
        b.add_order("30.00", None, 1);

        let mut registry = ServerRegistry::new(LocalStore::in_memory().unwrap());
        registry.register(dead_endpoint("a"), a.clone()).unwrap();
        registry.register(dead_endpoint("b"), b.clone()).unwrap();
        let registry = Arc::new(registry);

        let supervisor = RealtimeSupervisor::start(registry.clone(), "dev-1", settings()).unwrap();

        let mut synced = false;
        for _ in 0..100 {
            let va = registry.engine("a").unwrap().cursor().unwrap().last_synced_version;
            let vb = registry.engine("b").unwrap().cursor().unwrap().last_synced_version;
            if va == 1 && vb == 2 {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(synced, "backstop never synced both servers");

        let states = supervisor.connection_states();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|c| c.state != ConnectionState::Connected));

        supervisor.set_network_available(false);
        let mut all_down = false;
        for _ in 0..100 {
            if supervisor
                .connection_states()
                .iter()
                .all(|c| c.state == ConnectionState::Disconnected)
            {
                all_down = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(all_down);

        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .expect("shutdown hung");
    }
}
