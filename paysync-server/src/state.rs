//! Shared handler state.

use crate::allocator::SuffixAllocator;
use crate::auth::SqliteNonceLedger;
use crate::config::ServerConfig;
use crate::matcher::ReconciliationMatcher;
use crate::orders::{OrderBook, SqliteOrderBook};
use crate::rate_limit::NotifyThrottle;
use crate::storage::ServerStorage;
use paysync_core::envelope::SecureEnvelope;
use paysync_core::protocol::ChannelFrame;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub storage: ServerStorage,
    pub envelope: Arc<SecureEnvelope>,
    pub nonces: SqliteNonceLedger,
    pub allocator: SuffixAllocator,
    pub matcher: ReconciliationMatcher,
    pub throttle: NotifyThrottle,
    /// Realtime frames for every connected device.
    pub bus: broadcast::Sender<ChannelFrame>,
}

impl AppState {
    pub fn new(config: ServerConfig, storage: ServerStorage) -> Self {
        let order_book = Arc::new(SqliteOrderBook::new(storage.clone()));
        Self::with_order_book(config, storage, order_book)
    }

    pub fn with_order_book(
        config: ServerConfig,
        storage: ServerStorage,
        order_book: Arc<dyn OrderBook>,
    ) -> Self {
        let (bus, _) = broadcast::channel(1024);
        let envelope = SecureEnvelope::new(&config.shared_secret)
            .with_tolerance_ms(config.timestamp_tolerance_ms);

        Self {
            envelope: Arc::new(envelope),
            nonces: SqliteNonceLedger::new(storage.clone()),
            allocator: SuffixAllocator::new(storage.clone(), config.max_suffix),
            matcher: ReconciliationMatcher::new(
                storage.clone(),
                order_book,
                config.approval_mode,
                bus.clone(),
            ),
            throttle: NotifyThrottle::new(config.rate_limit_per_minute),
            bus,
            storage,
            config: Arc::new(config),
        }
    }
}
