//! Shared server state.
//!
//! `SyncServer` owns the storage handle, the IM engine client and the three
//! services built on them, plus rate limits and operational counters. The
//! HTTP layer and the cleanup task share one `Arc<SyncServer>`.

use crate::actions::MessageActions;
use crate::config::Config;
use crate::coordinator::SyncCoordinator;
use crate::engine::ImEngine;
use crate::limits::RateLimits;
use crate::reminders::ReminderEngine;
use crate::storage::SqliteStorage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Operational metrics for monitoring sync activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Conversation syncs served.
    pub syncs_total: AtomicU64,
    /// Acks that persisted a batch.
    pub acks_total: AtomicU64,
    /// Acks that failed and left the batch staged.
    pub ack_failures_total: AtomicU64,
    /// Requests that failed because the IM engine did.
    pub engine_failures_total: AtomicU64,
    /// Channel offsets advanced by clears.
    pub offsets_advanced_total: AtomicU64,
    /// Message-extra mutations (revoke, edit, pin, delete, read).
    pub extra_mutations_total: AtomicU64,
    /// Reaction toggles.
    pub reactions_toggled_total: AtomicU64,
    /// Reminders created from delivered messages.
    pub reminders_derived_total: AtomicU64,
    /// Requests refused by a rate limiter.
    pub rate_limit_hits: AtomicU64,
    /// Requests that ended in any error.
    pub errors_total: AtomicU64,
}

impl ServerMetrics {
    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment a counter.
    pub fn inc(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// The conversation sync server.
pub struct SyncServer {
    config: Config,
    storage: Arc<SqliteStorage>,
    coordinator: SyncCoordinator,
    actions: MessageActions,
    reminders: ReminderEngine,
    rate_limits: RateLimits,
    metrics: ServerMetrics,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("staged_users", &self.coordinator.staged_users())
            .finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Create a server over `storage` talking to `engine`.
    pub fn new(config: Config, storage: SqliteStorage, engine: Arc<dyn ImEngine>) -> Self {
        let storage = Arc::new(storage);
        Self {
            coordinator: SyncCoordinator::new(storage.clone(), engine.clone(), config.sync.clone()),
            actions: MessageActions::new(storage.clone(), engine),
            reminders: ReminderEngine::new(storage.clone(), config.sync.clone()),
            rate_limits: RateLimits::new(&config.limits),
            metrics: ServerMetrics::default(),
            storage,
            config,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Storage layer.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Conversation sync and per-channel pulls.
    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// Message mutations and offsets.
    pub fn actions(&self) -> &MessageActions {
        &self.actions
    }

    /// Reminder derivation and sync.
    pub fn reminders(&self) -> &ReminderEngine {
        &self.reminders
    }

    /// Rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Operational counters.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockImEngine;

    #[tokio::test]
    async fn new_server_starts_idle() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let server = SyncServer::new(Config::default(), storage, Arc::new(MockImEngine::new()));
        assert_eq!(server.coordinator().staged_users(), 0);
        assert_eq!(server.rate_limits().user_keys_count(), 0);
        assert_eq!(ServerMetrics::get(&server.metrics().syncs_total), 0);
        assert!(server.storage().ping().await.is_ok());
    }

    #[test]
    fn counters_accumulate() {
        let metrics = ServerMetrics::default();
        ServerMetrics::inc(&metrics.acks_total);
        ServerMetrics::add(&metrics.acks_total, 4);
        assert_eq!(ServerMetrics::get(&metrics.acks_total), 5);
    }

    #[tokio::test]
    async fn debug_is_non_exhaustive() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let server = SyncServer::new(Config::default(), storage, Arc::new(MockImEngine::new()));
        let debug = format!("{server:?}");
        assert!(debug.contains("SyncServer"));
        assert!(debug.contains(".."));
    }
}
