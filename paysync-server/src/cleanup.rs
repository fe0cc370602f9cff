//! Background cleanup: prune the nonce ledger, expire stale reservations.

use crate::error::ServerError;
use crate::state::AppState;
use paysync_core::now_ms;
use std::time::Duration;
use tokio::time;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub nonces_pruned: usize,
    pub reservations_expired: usize,
}

pub fn spawn_cleanup_task(state: AppState) -> tokio::task::JoinHandle<()> {
    let every = Duration::from_secs(state.config.cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            match run_cleanup(&state, now_ms()) {
                Ok(stats) => tracing::debug!(
                    nonces_pruned = stats.nonces_pruned,
                    reservations_expired = stats.reservations_expired,
                    "Cleanup completed"
                ),
                Err(e) => tracing::error!("Cleanup error: {}", e),
            }
        }
    })
}

pub fn run_cleanup(state: &AppState, now_ms: i64) -> Result<CleanupStats, ServerError> {
    // Retention exceeds the freshness tolerance: a pruned nonce's envelope is already stale
    let nonce_cutoff = now_ms - state.config.nonce_retention_secs * 1000;
    let nonces_pruned = state.nonces.prune(nonce_cutoff)?;
    let reservations_expired = state.allocator.expire_stale(now_ms)?;
    state.throttle.forget_idle(Duration::from_secs(3600));

    Ok(CleanupStats {
        nonces_pruned,
        reservations_expired,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::storage::ServerStorage;
    use paysync_core::envelope::NonceLedger;
    use paysync_core::money::Amount;

    #[test]
    fn prunes_old_nonces_and_expires_reservations() {
        let config = ServerConfig {
            api_key: "k".into(),
            shared_secret: "s".into(),
            ..ServerConfig::default()
        };
        let state = AppState::new(config, ServerStorage::in_memory().unwrap());
        let now = 1_700_000_000_000;

        state.nonces.record("dev-1", "old", now - 1_000_000).unwrap();
        state.nonces.record("dev-1", "fresh", now - 1_000).unwrap();
        state
            .allocator
            .reserve_at(Amount::from_units(10).unwrap(), 1, None, now - 120_000)
            .unwrap();

        let stats = run_cleanup(&state, now).unwrap();
        assert_eq!(
            stats,
            CleanupStats {
                nonces_pruned: 1,
                reservations_expired: 1,
            }
        );
        // Retained nonces still count as replays
        assert!(!state.nonces.record("dev-1", "fresh", now).unwrap());
    }
}
