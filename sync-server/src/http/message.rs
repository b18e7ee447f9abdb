//! Message action endpoints.

use super::{login_uid, ok, track, ApiJson};
use crate::error::Result;
use crate::server::{ServerMetrics, SyncServer};
use crate::storage::EditOutcome;
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use sync_types::api::{
    EditRequest, MemberOffsetRequest, MessageRef, OffsetRequest, ReactionRequest,
    ReactionToggleResponse, ReadedRequest, RevokeRequest,
};
use sync_types::EngineMessage;

fn mutated(server: &SyncServer) {
    ServerMetrics::inc(&server.metrics().extra_mutations_total);
}

pub(super) async fn revoke(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RevokeRequest>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    let version = track(&server, server.actions().revoke(&uid, &req).await)?;
    mutated(&server);
    Ok(Json(json!({ "status": 200, "version": version })))
}

pub(super) async fn edit(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<EditRequest>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    if let EditOutcome::Applied(_) = track(&server, server.actions().edit(&uid, &req).await)? {
        mutated(&server);
    }
    Ok(ok())
}

pub(super) async fn toggle_pinned(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(message): ApiJson<MessageRef>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    let (pinned, version) = track(&server, server.actions().toggle_pinned(&uid, &message).await)?;
    mutated(&server);
    Ok(Json(json!({
        "status": 200,
        "is_pinned": u8::from(pinned),
        "version": version,
    })))
}

pub(super) async fn mutual_delete(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(message): ApiJson<MessageRef>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    track(&server, server.actions().mutual_delete(&uid, &message).await)?;
    mutated(&server);
    Ok(ok())
}

pub(super) async fn delete_for_user(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(messages): ApiJson<Vec<MessageRef>>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    track(&server, server.actions().delete_for_user(&uid, &messages).await)?;
    if !messages.is_empty() {
        mutated(&server);
    }
    Ok(ok())
}

pub(super) async fn mark_read(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ReadedRequest>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    let newly_read = track(&server, server.actions().mark_read(&uid, &req).await)?;
    ServerMetrics::add(&server.metrics().extra_mutations_total, newly_read);
    Ok(ok())
}

pub(super) async fn mark_voice_read(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(message): ApiJson<MessageRef>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    track(&server, server.actions().mark_voice_read(&uid, &message).await)?;
    Ok(ok())
}

pub(super) async fn toggle_reaction(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ReactionRequest>,
) -> Result<Json<ReactionToggleResponse>> {
    let uid = login_uid(&server, &headers)?;
    let toggled = track(&server, server.actions().toggle_reaction(&uid, &req).await)?;
    ServerMetrics::inc(&server.metrics().reactions_toggled_total);
    Ok(Json(toggled))
}

pub(super) async fn clear_channel(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<OffsetRequest>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    if track(&server, server.actions().clear_channel(&uid, &req).await)? {
        ServerMetrics::inc(&server.metrics().offsets_advanced_total);
    }
    Ok(ok())
}

/// Membership hook of the IM engine: members (re)joined a group.
pub(super) async fn reset_member_offsets(
    Extension(server): Extension<Arc<SyncServer>>,
    ApiJson(req): ApiJson<MemberOffsetRequest>,
) -> Result<Json<Value>> {
    track(&server, server.actions().reset_member_offsets(&req).await)?;
    Ok(ok())
}

/// Membership hook of the IM engine: members left or were removed.
pub(super) async fn remove_members(
    Extension(server): Extension<Arc<SyncServer>>,
    ApiJson(req): ApiJson<MemberOffsetRequest>,
) -> Result<Json<Value>> {
    let retracted = track(&server, server.actions().remove_members(&req).await)?;
    Ok(Json(json!({ "status": 200, "retracted": retracted })))
}

/// Delivery webhook of the IM engine. Carries no login uid.
pub(super) async fn derive_reminders(
    Extension(server): Extension<Arc<SyncServer>>,
    ApiJson(messages): ApiJson<Vec<EngineMessage>>,
) -> Result<Json<Value>> {
    let created = track(&server, server.reminders().ingest(&messages).await)?;
    ServerMetrics::add(&server.metrics().reminders_derived_total, created);
    Ok(Json(json!({ "status": 200, "created": created })))
}
