//! Prometheus metrics endpoint.

use crate::server::SyncServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Gauges report current in-process state; counters are monotonic since
/// startup.
pub async fn metrics_handler(Extension(server): Extension<Arc<SyncServer>>) -> impl IntoResponse {
    let m = server.metrics();

    let staged_batches = server.coordinator().staged_batches();
    let staged_users = server.coordinator().staged_users();
    let limited_users = server.rate_limits().user_keys_count();

    let syncs = m.syncs_total.load(Ordering::Relaxed);
    let acks = m.acks_total.load(Ordering::Relaxed);
    let ack_failures = m.ack_failures_total.load(Ordering::Relaxed);
    let engine_failures = m.engine_failures_total.load(Ordering::Relaxed);
    let offsets = m.offsets_advanced_total.load(Ordering::Relaxed);
    let extras = m.extra_mutations_total.load(Ordering::Relaxed);
    let reactions = m.reactions_toggled_total.load(Ordering::Relaxed);
    let reminders = m.reminders_derived_total.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    let body = format!(
        r#"# HELP convsync_staged_batches Device batches waiting for an ack
# TYPE convsync_staged_batches gauge
convsync_staged_batches {staged_batches}

# HELP convsync_staged_users Users with staging state
# TYPE convsync_staged_users gauge
convsync_staged_users {staged_users}

# HELP convsync_rate_limited_users Uids tracked by the rate limiter
# TYPE convsync_rate_limited_users gauge
convsync_rate_limited_users {limited_users}

# HELP convsync_info Server information
# TYPE convsync_info gauge
convsync_info{{version="{version}"}} 1

# HELP convsync_syncs_total Conversation syncs served
# TYPE convsync_syncs_total counter
convsync_syncs_total {syncs}

# HELP convsync_acks_total Acks that persisted a staged batch
# TYPE convsync_acks_total counter
convsync_acks_total {acks}

# HELP convsync_ack_failures_total Acks that failed or expired
# TYPE convsync_ack_failures_total counter
convsync_ack_failures_total {ack_failures}

# HELP convsync_engine_failures_total Requests failed by the IM engine
# TYPE convsync_engine_failures_total counter
convsync_engine_failures_total {engine_failures}

# HELP convsync_offsets_advanced_total Channel offsets advanced
# TYPE convsync_offsets_advanced_total counter
convsync_offsets_advanced_total {offsets}

# HELP convsync_extra_mutations_total Message extra mutations
# TYPE convsync_extra_mutations_total counter
convsync_extra_mutations_total {extras}

# HELP convsync_reactions_toggled_total Reaction toggles
# TYPE convsync_reactions_toggled_total counter
convsync_reactions_toggled_total {reactions}

# HELP convsync_reminders_derived_total Reminders created from delivered messages
# TYPE convsync_reminders_derived_total counter
convsync_reminders_derived_total {reminders}

# HELP convsync_rate_limit_hits_total Requests refused by a rate limiter
# TYPE convsync_rate_limit_hits_total counter
convsync_rate_limit_hits_total {rate_limits}

# HELP convsync_errors_total Requests that ended in an error
# TYPE convsync_errors_total counter
convsync_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::MockImEngine;
    use crate::server::ServerMetrics;
    use crate::storage::SqliteStorage;

    #[tokio::test]
    async fn counters_are_rendered() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let server = Arc::new(SyncServer::new(
            Config::default(),
            storage,
            Arc::new(MockImEngine::new()),
        ));
        ServerMetrics::add(&server.metrics().syncs_total, 3);

        let response = metrics_handler(Extension(server)).await.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("# TYPE convsync_syncs_total counter"));
        assert!(text.contains("convsync_syncs_total 3"));
        assert!(text.contains("convsync_staged_batches 0"));
    }
}
