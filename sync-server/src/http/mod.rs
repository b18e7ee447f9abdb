//! HTTP endpoints for convsync-server.
//!
//! Two routers are served on separate listeners:
//! - [`build_router`]: client-facing sync and message-action routes. They
//!   take the login uid from the `x-login-uid` header (authentication happens
//!   upstream) and are rate limited per uid and globally.
//! - [`build_internal_router`]: hooks the IM engine calls on delivery and on
//!   membership changes. They carry no uid and belong on a private interface.
//!
//! Request bodies that fail to parse are answered with the same
//! `{"status": 400, "msg": ...}` body as every other validation error.

pub mod health;
mod message;
mod metrics;
mod sync;

use crate::error::{Result, ServerError};
use crate::server::{ServerMetrics, SyncServer};
use axum::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use sync_types::{validate_uid, SyncError};

pub use health::HealthStatus;

/// Header carrying the authenticated uid.
pub const LOGIN_UID_HEADER: &str = "x-login-uid";

/// Build the HTTP router with all endpoints.
pub fn build_router(server: Arc<SyncServer>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health_handler))
        .route("/v1/conversation/sync", post(sync::conversation_sync))
        .route("/v1/conversation/syncack", post(sync::conversation_sync_ack))
        .route("/v1/conversation/device/reconcile", post(sync::device_reconcile))
        .route("/v1/conversation/extra/sync", post(sync::conversation_extra_sync))
        .route(
            "/v1/conversations/:channel_id/:channel_type/extra",
            post(sync::conversation_extra_upsert),
        )
        .route("/v1/message/channel/sync", post(sync::channel_sync))
        .route("/v1/message/extra/sync", post(sync::message_extra_sync))
        .route("/v1/reaction/sync", post(sync::reaction_sync))
        .route("/v1/message/reminder/sync", post(sync::reminder_sync))
        .route("/v1/message/reminder/done", post(sync::reminder_done))
        .route("/v1/message", axum::routing::delete(message::delete_for_user))
        .route("/v1/message/revoke", post(message::revoke))
        .route("/v1/message/edit", post(message::edit))
        .route("/v1/message/pinned", post(message::toggle_pinned))
        .route("/v1/message/mutual_delete", post(message::mutual_delete))
        .route("/v1/message/readed", post(message::mark_read))
        .route("/v1/message/voicereaded", post(message::mark_voice_read))
        .route("/v1/reactions", post(message::toggle_reaction))
        .route("/v1/message/offset", post(message::clear_channel));

    if server.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(server))
}

/// Build the router of engine-facing hooks.
pub fn build_internal_router(server: Arc<SyncServer>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/v1/message/reminders/derive", post(message::derive_reminders))
        .route("/v1/message/members/offset", post(message::reset_member_offsets))
        .route("/v1/message/members/remove", post(message::remove_members))
        .layer(Extension(server))
}

/// JSON body extractor whose rejection is a [`ServerError::Validation`].
struct ApiJson<T>(T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Authenticated uid of a request, after rate limiting.
fn login_uid(server: &SyncServer, headers: &HeaderMap) -> Result<String> {
    let uid = headers
        .get(LOGIN_UID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|uid| !uid.is_empty())
        .ok_or(SyncError::MissingField(LOGIN_UID_HEADER))?;
    validate_uid(uid)?;

    if let Err(e) = server.rate_limits().check(uid) {
        ServerMetrics::inc(&server.metrics().rate_limit_hits);
        tracing::debug!(uid, reason = %e, "Request rate limited");
        return Err(ServerError::RateLimited {
            reason: e.to_string(),
        });
    }
    Ok(uid.to_string())
}

/// Count a failed request before it is turned into a response.
fn track<T>(server: &SyncServer, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        let metrics = server.metrics();
        ServerMetrics::inc(&metrics.errors_total);
        if matches!(e, ServerError::Engine(_)) {
            ServerMetrics::inc(&metrics.engine_failures_total);
        }
    }
    result
}

fn ok() -> Json<Value> {
    Json(json!({ "status": 200 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{mock_conversation, mock_message, MockImEngine};
    use crate::storage::SqliteStorage;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sync_types::ChannelKey;
    use tower::util::ServiceExt;

    async fn test_server(config: Config) -> (Arc<SyncServer>, Arc<MockImEngine>) {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let engine = Arc::new(MockImEngine::new());
        (
            Arc::new(SyncServer::new(config, storage, engine.clone())),
            engine,
        )
    }

    fn post_json(uri: &str, uid: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(uid) = uid {
            builder = builder.header(LOGIN_UID_HEADER, uid);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (server, _) = test_server(Config::default()).await;
        let app = build_router(server);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let (server, _) = test_server(Config::default()).await;
        let app = build_router(server);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_can_be_disabled() {
        let mut config = Config::default();
        config.http.metrics_enabled = false;
        let (server, _) = test_server(config).await;

        let response = build_router(server)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_login_uid_is_bad_request() {
        let (server, _) = test_server(Config::default()).await;
        let response = build_router(server)
            .oneshot(post_json("/v1/conversation/sync", None, json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], 400);
    }

    #[tokio::test]
    async fn login_uid_with_the_fake_channel_separator_is_rejected() {
        let (server, _) = test_server(Config::default()).await;
        let response = build_router(server)
            .oneshot(post_json(
                "/v1/conversation/sync",
                Some("alice@example.com"),
                json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["msg"], "invalid uid: alice@example.com");
    }

    #[tokio::test]
    async fn sync_then_ack_over_http() {
        let (server, engine) = test_server(Config::default()).await;
        let g1 = ChannelKey::group("g1");
        engine
            .set_conversations(
                "alice",
                vec![mock_conversation(
                    &g1,
                    7,
                    vec![mock_message(&g1, 2, "bob", r#"{"type":1}"#)],
                )],
            )
            .await;
        let app = build_router(server.clone());

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/conversation/sync",
                Some("alice"),
                json!({"version": 0, "last_msg_seqs": "", "msg_count": 20, "device_uuid": "d1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["uid"], "alice");
        assert_eq!(body["conversations"][0]["channel_id"], "g1");
        assert_eq!(body["conversations"][0]["recents"][0]["message_seq"], 2);

        let response = app
            .oneshot(post_json(
                "/v1/conversation/syncack",
                Some("alice"),
                json!({"cmd_version": 0, "device_uuid": "d1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(ServerMetrics::get(&server.metrics().syncs_total), 1);
        assert_eq!(ServerMetrics::get(&server.metrics().acks_total), 1);
    }

    #[tokio::test]
    async fn engine_outage_is_service_unavailable() {
        let (server, engine) = test_server(Config::default()).await;
        engine.fail_with(Some("engine down")).await;

        let response = build_router(server.clone())
            .oneshot(post_json(
                "/v1/conversation/sync",
                Some("alice"),
                json!({"device_uuid": "d1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ServerMetrics::get(&server.metrics().engine_failures_total), 1);
        assert_eq!(ServerMetrics::get(&server.metrics().errors_total), 1);
    }

    #[tokio::test]
    async fn rate_limited_requests_get_429() {
        let mut config = Config::default();
        config.limits.requests_per_minute = 1;
        let (server, _) = test_server(config).await;
        let app = build_router(server.clone());

        let body = json!({"version": 0});
        let first = app
            .clone()
            .oneshot(post_json("/v1/conversation/extra/sync", Some("alice"), body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(post_json("/v1/conversation/extra/sync", Some("alice"), body))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ServerMetrics::get(&server.metrics().rate_limit_hits), 1);
    }

    #[tokio::test]
    async fn reaction_toggle_and_sync_over_http() {
        let (server, _) = test_server(Config::default()).await;
        let app = build_router(server);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/reactions",
                Some("alice"),
                json!({"message_id": "m1", "channel_id": "bob", "channel_type": 1, "emoji": "👍", "name": "Alice"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let toggled = body_json(response).await;
        assert_eq!(toggled["is_deleted"], 0);

        let response = app
            .oneshot(post_json(
                "/v1/reaction/sync",
                Some("bob"),
                json!({"channel_id": "alice", "channel_type": 1, "seq": 0, "limit": 10}),
            ))
            .await
            .unwrap();
        let synced = body_json(response).await;
        assert_eq!(synced[0]["uid"], "alice");
        assert_eq!(synced[0]["channel_id"], "alice");
    }

    #[tokio::test]
    async fn derived_reminders_are_synced_and_done() {
        let (server, _) = test_server(Config::default()).await;
        let app = build_router(server.clone());
        let g1 = ChannelKey::group("g1");
        let delivered = serde_json::to_value(vec![mock_message(
            &g1,
            4,
            "bob",
            r#"{"mention":{"uids":["alice"]}}"#,
        )])
        .unwrap();

        let response = build_internal_router(server.clone())
            .oneshot(post_json("/v1/message/reminders/derive", None, delivered))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["created"], 1);
        assert_eq!(ServerMetrics::get(&server.metrics().reminders_derived_total), 1);

        let response = app
            .clone()
            .oneshot(post_json("/v1/message/reminder/sync", Some("alice"), json!({"version": 0})))
            .await
            .unwrap();
        let reminders = body_json(response).await;
        let id = reminders[0]["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(post_json("/v1/message/reminder/done", Some("alice"), json!([id])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json("/v1/message/reminder/sync", Some("alice"), json!({"version": 0})))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn conversation_extra_upsert_by_path() {
        let (server, _) = test_server(Config::default()).await;
        let app = build_router(server);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/conversations/g1/2/extra",
                Some("alice"),
                json!({"browse_to": 9, "draft": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/conversations/g1/42/extra",
                Some("alice"),
                json!({"draft": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json("/v1/conversation/extra/sync", Some("alice"), json!({"version": 0})))
            .await
            .unwrap();
        let extras = body_json(response).await;
        assert_eq!(extras[0]["draft"], "hello");
        assert_eq!(extras[0]["browse_to"], 9);
    }

    #[tokio::test]
    async fn clear_channel_counts_advances() {
        let (server, engine) = test_server(Config::default()).await;
        let app = build_router(server.clone());
        let body = json!({"channel_id": "g1", "channel_type": 2, "message_seq": 10});

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post_json("/v1/message/offset", Some("alice"), body.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(ServerMetrics::get(&server.metrics().offsets_advanced_total), 1);
        assert_eq!(engine.cleared().await.len(), 1);
    }

    #[tokio::test]
    async fn per_user_delete_uses_delete_method() {
        let (server, _) = test_server(Config::default()).await;
        let request = Request::builder()
            .method("DELETE")
            .uri("/v1/message")
            .header("content-type", "application/json")
            .header(LOGIN_UID_HEADER, "alice")
            .body(Body::from(
                json!([{"message_id": "m1", "message_seq": 1, "channel_id": "g1", "channel_type": 2}])
                    .to_string(),
            ))
            .unwrap();

        let response = build_router(server.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(ServerMetrics::get(&server.metrics().extra_mutations_total), 1);
    }

    #[tokio::test]
    async fn engine_hooks_are_only_on_the_internal_router() {
        use crate::storage::OffsetStore;

        let (server, _) = test_server(Config::default()).await;
        let body = json!({"channel_id": "g1", "channel_type": 2, "uids": ["alice"], "channel_max_seq": 30});

        for uri in [
            "/v1/message/reminders/derive",
            "/v1/message/members/offset",
            "/v1/message/members/remove",
        ] {
            let response = build_router(server.clone())
                .oneshot(post_json(uri, Some("alice"), body.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }

        let response = build_internal_router(server.clone())
            .oneshot(post_json("/v1/message/members/offset", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let g1 = ChannelKey::group("g1");
        assert_eq!(
            server.storage().channel_offset("alice", &g1).await.unwrap(),
            Some(30)
        );
    }

    #[tokio::test]
    async fn malformed_bodies_get_a_json_validation_error() {
        let (server, _) = test_server(Config::default()).await;
        let app = build_router(server);

        let broken = Request::builder()
            .method("POST")
            .uri("/v1/conversation/sync")
            .header("content-type", "application/json")
            .header(LOGIN_UID_HEADER, "alice")
            .body(Body::from("{\"version\": "))
            .unwrap();
        let response = app.clone().oneshot(broken).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], 400);
        assert!(body["msg"].as_str().unwrap().starts_with("invalid data"));

        let wrong_type = post_json(
            "/v1/message/offset",
            Some("alice"),
            json!({"channel_id": "g1", "channel_type": "group", "message_seq": 1}),
        );
        let response = app.clone().oneshot(wrong_type).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], 400);

        let untyped = Request::builder()
            .method("POST")
            .uri("/v1/reactions")
            .header(LOGIN_UID_HEADER, "alice")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(untyped).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], 400);
    }
}
