//! Sync endpoints: conversations, channel history, extras, reactions and
//! reminders.

use super::{login_uid, ok, track, ApiJson};
use crate::error::Result;
use crate::server::{ServerMetrics, SyncServer};
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use sync_types::api::{
    ChannelMessageSyncRequest, ChannelMessageSyncResponse, ConversationExtraRequest,
    ConversationExtraSyncRequest, ConversationExtraView, ConversationSyncAckRequest,
    ConversationSyncRequest, ConversationSyncResponse, DeviceReconcileRequest,
    MessageExtraSyncRequest, MessageExtraView, ReactionSyncRequest, ReactionView,
    ReminderSyncRequest, ReminderView,
};
use sync_types::{ChannelKey, ChannelType};

pub(super) async fn conversation_sync(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ConversationSyncRequest>,
) -> Result<Json<ConversationSyncResponse>> {
    let uid = login_uid(&server, &headers)?;
    let response = track(
        &server,
        server.coordinator().sync_conversations(&uid, &req).await,
    )?;
    ServerMetrics::inc(&server.metrics().syncs_total);
    Ok(Json(response))
}

pub(super) async fn conversation_sync_ack(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ConversationSyncAckRequest>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    let metrics = server.metrics();
    match track(&server, server.coordinator().ack(&uid, &req).await) {
        Ok(Some(outcome)) => {
            ServerMetrics::inc(&metrics.acks_total);
            ServerMetrics::add(&metrics.offsets_advanced_total, outcome.channels as u64);
        }
        Ok(None) => {}
        Err(e) => {
            ServerMetrics::inc(&metrics.ack_failures_total);
            return Err(e);
        }
    }
    Ok(ok())
}

pub(super) async fn device_reconcile(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<DeviceReconcileRequest>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    let merged = track(&server, server.coordinator().reconcile_device(&uid, &req).await)?;
    Ok(Json(json!({ "status": 200, "merged": merged })))
}

pub(super) async fn conversation_extra_sync(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ConversationExtraSyncRequest>,
) -> Result<Json<Vec<ConversationExtraView>>> {
    let uid = login_uid(&server, &headers)?;
    let extras = track(
        &server,
        server.coordinator().sync_conversation_extras(&uid, &req).await,
    )?;
    Ok(Json(extras))
}

pub(super) async fn conversation_extra_upsert(
    Extension(server): Extension<Arc<SyncServer>>,
    Path((channel_id, channel_type)): Path<(String, u8)>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ConversationExtraRequest>,
) -> Result<Json<ConversationExtraView>> {
    let uid = login_uid(&server, &headers)?;
    let channel = ChannelKey::new(channel_id, ChannelType::try_from(channel_type)?);
    let view = track(
        &server,
        server
            .coordinator()
            .upsert_conversation_extra(&uid, &channel, &req)
            .await,
    )?;
    Ok(Json(view))
}

pub(super) async fn channel_sync(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ChannelMessageSyncRequest>,
) -> Result<Json<ChannelMessageSyncResponse>> {
    let uid = login_uid(&server, &headers)?;
    let page = track(
        &server,
        server.coordinator().sync_channel_messages(&uid, &req).await,
    )?;
    Ok(Json(page))
}

pub(super) async fn message_extra_sync(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<MessageExtraSyncRequest>,
) -> Result<Json<Vec<MessageExtraView>>> {
    let uid = login_uid(&server, &headers)?;
    let extras = track(
        &server,
        server.coordinator().sync_message_extras(&uid, &req).await,
    )?;
    Ok(Json(extras))
}

pub(super) async fn reaction_sync(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ReactionSyncRequest>,
) -> Result<Json<Vec<ReactionView>>> {
    let uid = login_uid(&server, &headers)?;
    let reactions = track(&server, server.coordinator().sync_reactions(&uid, &req).await)?;
    Ok(Json(reactions))
}

pub(super) async fn reminder_sync(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ReminderSyncRequest>,
) -> Result<Json<Vec<ReminderView>>> {
    let uid = login_uid(&server, &headers)?;
    let reminders = track(&server, server.reminders().sync(&uid, &req).await)?;
    Ok(Json(reminders))
}

pub(super) async fn reminder_done(
    Extension(server): Extension<Arc<SyncServer>>,
    headers: HeaderMap,
    ApiJson(ids): ApiJson<Vec<i64>>,
) -> Result<Json<Value>> {
    let uid = login_uid(&server, &headers)?;
    track(&server, server.reminders().mark_done(&uid, &ids).await)?;
    Ok(ok())
}
