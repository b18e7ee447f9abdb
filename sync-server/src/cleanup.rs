//! Background sweep for abandoned sync state.
//!
//! Runs periodically to expire staged batches whose ack never arrived and to
//! evict idle watermark and rate-limiter keys.

use crate::config::CleanupConfig;
use crate::server::{ServerMetrics, SyncServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Run one sweep. Returns the number of staged batches expired.
pub async fn sweep(server: &SyncServer) -> usize {
    let timeout = Duration::from_secs(server.config().sync.ack_timeout_secs);
    let expired = server.coordinator().expire_stale(timeout).await;
    let evicted = server.coordinator().watermarks().evict_idle(timeout);
    if evicted > 0 {
        tracing::debug!(evicted, "Evicted idle watermarks");
    }
    server.rate_limits().shrink();
    if expired > 0 {
        ServerMetrics::add(&server.metrics().ack_failures_total, expired as u64);
    }
    expired
}

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    server: Arc<SyncServer>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            let expired = sweep(&server).await;
            if expired > 0 {
                tracing::info!("Cleanup: expired {} unacked batches", expired);
            } else {
                tracing::debug!("Cleanup: nothing staged past the ack timeout");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{mock_conversation, mock_message, MockImEngine};
    use crate::storage::SqliteStorage;
    use sync_types::api::{ConversationSyncAckRequest, ConversationSyncRequest};
    use sync_types::ChannelKey;

    async fn server(ack_timeout_secs: u64) -> (Arc<SyncServer>, Arc<MockImEngine>) {
        let mut config = Config::default();
        config.sync.ack_timeout_secs = ack_timeout_secs;
        let engine = Arc::new(MockImEngine::new());
        let storage = SqliteStorage::in_memory().await.unwrap();
        (
            Arc::new(SyncServer::new(config, storage, engine.clone())),
            engine,
        )
    }

    #[tokio::test]
    async fn sweep_expires_unacked_batches() {
        let (server, engine) = server(0).await;
        let g1 = ChannelKey::group("g1");
        engine
            .set_conversations(
                "alice",
                vec![mock_conversation(&g1, 3, vec![mock_message(&g1, 1, "bob", "{}")])],
            )
            .await;
        server
            .coordinator()
            .sync_conversations(
                "alice",
                &ConversationSyncRequest {
                    device_uuid: "d1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(server.coordinator().staged_batches(), 1);

        assert_eq!(sweep(&server).await, 1);
        assert_eq!(server.coordinator().staged_batches(), 0);
        assert_eq!(sweep(&server).await, 0);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_watermarks() {
        let (server, engine) = server(0).await;
        let g1 = ChannelKey::group("g1");
        engine
            .set_conversations(
                "alice",
                vec![mock_conversation(&g1, 3, vec![mock_message(&g1, 1, "bob", "{}")])],
            )
            .await;
        let coordinator = server.coordinator();
        coordinator
            .sync_conversations(
                "alice",
                &ConversationSyncRequest {
                    device_uuid: "d1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        coordinator
            .ack(
                "alice",
                &ConversationSyncAckRequest {
                    cmd_version: 0,
                    device_uuid: "d1".into(),
                },
            )
            .await
            .unwrap();
        assert!(coordinator.watermarks().cached() > 0);

        sweep(&server).await;
        assert_eq!(coordinator.watermarks().cached(), 0);
        assert_eq!(coordinator.staged_users(), 0);
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_batches() {
        let (server, engine) = server(300).await;
        let g1 = ChannelKey::group("g1");
        engine
            .set_conversations(
                "alice",
                vec![mock_conversation(&g1, 3, vec![mock_message(&g1, 1, "bob", "{}")])],
            )
            .await;
        server
            .coordinator()
            .sync_conversations(
                "alice",
                &ConversationSyncRequest {
                    device_uuid: "d1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(sweep(&server).await, 0);
        assert_eq!(server.coordinator().staged_batches(), 1);
    }

    #[tokio::test]
    async fn cleanup_task_disabled() {
        let (server, _) = server(300).await;
        let config = CleanupConfig {
            interval_secs: 1,
            enabled: false,
        };

        let handle = spawn_cleanup_task(server, config);

        // Task should complete immediately when disabled
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }
}
