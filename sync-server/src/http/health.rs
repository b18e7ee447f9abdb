//! Health check endpoint.

use crate::server::SyncServer;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `ok`, or `degraded` when the database does not answer.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Device batches waiting for an ack.
    pub staged_batches: usize,
    /// Users with staging state.
    pub staged_users: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(server): Extension<Arc<SyncServer>>) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    let status = match server.storage().ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Health check: database unreachable");
            "degraded"
        }
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        staged_batches: server.coordinator().staged_batches(),
        staged_users: server.coordinator().staged_users(),
        uptime_seconds: uptime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            staged_batches: 3,
            staged_users: 2,
            uptime_seconds: 3600,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"staged_batches\":3"));
    }
}
