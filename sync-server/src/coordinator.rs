//! Conversation sync orchestration.
//!
//! A sync resolves the device's baseline version, fetches changed
//! conversations from the IM engine, drops conversations of groups the user
//! left, filters out messages at or below the channel/device offsets,
//! enriches what is left with extras and reactions, and stages the returned
//! high-water marks per (uid, device). Offsets and version watermarks only
//! advance when the device acks; until then a resync returns at least the
//! same messages.
//!
//! Staging is process-local and not durable. A restart between sync and ack
//! is the same as an ack that never arrived.

use crate::config::SyncConfig;
use crate::engine::ImEngine;
use crate::error::{Result, StorageResult};
use crate::storage::{
    ConversationExtraStore, ConversationExtraUpdate, ExtraDetail, ExtraStore, OffsetStore,
    ReactionStore, SqliteStorage,
};
use crate::watermarks::{
    device_max_version_key, message_extra_version_key, user_max_version_key, Watermarks,
};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::{
    decode_last_msg_seqs, encode_last_msg_seqs, Action, DeviceSyncState, OffsetWindow,
    StagedBatch, SyncEvent,
};
use sync_types::api::{
    ChannelMessageSyncRequest, ChannelMessageSyncResponse, ConversationExtraRequest,
    ConversationExtraSyncRequest, ConversationExtraView, ConversationSyncAckRequest,
    ConversationSyncRequest, ConversationSyncResponse, DeviceReconcileRequest,
    MessageExtraSyncRequest, MessageExtraView, ReactionSyncRequest, ReactionView,
    SyncConversation, SyncMessage,
};
use sync_types::engine::{ChannelMessagesRequest, ConversationSnapshot, FetchConversationsRequest};
use sync_types::{peer_of, ChannelKey, ChannelType, EngineMessage, SyncError, Version};
use tokio::sync::RwLock;

/// Sync session of one device.
#[derive(Debug, Default)]
struct DeviceStaging {
    state: DeviceSyncState,
    batch: StagedBatch,
    staged_at: Option<Instant>,
}

/// Staged batches of every device of one user.
#[derive(Debug, Default)]
struct UserStaging {
    devices: HashMap<String, DeviceStaging>,
}

/// What an ack persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    /// Channels whose offsets were merged.
    pub channels: usize,
    /// Conversation version the device watermark was raised to.
    pub version: Version,
}

/// The channel `uid` uses for a message it receives.
fn client_channel(message: &EngineMessage, uid: &str) -> ChannelKey {
    if message.channel_type == ChannelType::Person {
        if let Some(peer) = peer_of(&message.channel_id, uid) {
            return ChannelKey::person(peer);
        }
        if message.channel_id == uid {
            return ChannelKey::person(message.from_uid.clone());
        }
    }
    message.channel()
}

/// Orchestrates conversation sync, ack and the per-channel delta pulls.
pub struct SyncCoordinator {
    storage: Arc<SqliteStorage>,
    engine: Arc<dyn ImEngine>,
    watermarks: Watermarks,
    staging: DashMap<String, Arc<RwLock<UserStaging>>>,
    config: SyncConfig,
}

impl SyncCoordinator {
    /// Create a coordinator. `config.save_across_device` selects user-scoped
    /// (true) or device-scoped (false) offsets.
    pub fn new(storage: Arc<SqliteStorage>, engine: Arc<dyn ImEngine>, config: SyncConfig) -> Self {
        Self {
            watermarks: Watermarks::new(storage.clone()),
            storage,
            engine,
            staging: DashMap::new(),
            config,
        }
    }

    /// Whether offsets and watermarks are tracked per device.
    pub fn per_device(&self) -> bool {
        !self.config.save_across_device
    }

    fn device_scope<'a>(&self, device_uuid: &'a str) -> Option<&'a str> {
        let device = device_uuid.trim();
        (self.per_device() && !device.is_empty()).then_some(device)
    }

    fn user_staging(&self, uid: &str) -> Arc<RwLock<UserStaging>> {
        self.staging
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(UserStaging::default())))
            .clone()
    }

    fn existing_staging(&self, uid: &str) -> Option<Arc<RwLock<UserStaging>>> {
        self.staging.get(uid).map(|entry| entry.value().clone())
    }

    // ---------------------------------------------------------------------
    // Conversation sync
    // ---------------------------------------------------------------------

    /// Serve a conversation sync and stage its high-water marks.
    pub async fn sync_conversations(
        &self,
        uid: &str,
        req: &ConversationSyncRequest,
    ) -> Result<ConversationSyncResponse> {
        decode_last_msg_seqs(&req.last_msg_seqs)?;
        let device = self.device_scope(&req.device_uuid);

        if let Some(device) = device {
            self.on_sync_requested(uid, device).await;
        }
        let baseline = self.resolve_baseline(uid, device, req.version).await?;

        let mut device_offsets = HashMap::new();
        let mut last_msg_seqs = req.last_msg_seqs.clone();
        if let Some(device) = device {
            device_offsets = self.storage.device_offsets_or_seed(uid, device).await?;
            if !device_offsets.is_empty() {
                let mut seqs: Vec<_> = device_offsets.iter().map(|(c, s)| (c, *s)).collect();
                seqs.sort_by(|a, b| a.0.channel_id.cmp(&b.0.channel_id));
                last_msg_seqs = encode_last_msg_seqs(seqs);
            }
        }

        let larges = self.engine.broadcast_channels(uid).await?;
        let msg_count = if req.msg_count == 0 {
            self.config.default_msg_count
        } else {
            req.msg_count
        };
        let snapshots = self
            .engine
            .fetch_user_conversations(&FetchConversationsRequest {
                uid: uid.to_string(),
                version: baseline,
                last_msg_seqs,
                msg_count,
                larges,
            })
            .await?;

        let group_ids: Vec<String> = snapshots
            .iter()
            .filter(|s| s.channel_type == ChannelType::Group && !s.recents.is_empty())
            .map(|s| s.channel_id.clone())
            .collect();
        let member_of = if group_ids.is_empty() {
            HashSet::new()
        } else {
            self.engine.member_groups(&group_ids, uid).await?
        };

        let mut live = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            if snapshot.recents.is_empty() {
                continue;
            }
            if snapshot.channel_type == ChannelType::Group
                && !member_of.contains(&snapshot.channel_id)
            {
                tracing::debug!(uid, channel = %snapshot.channel(), "Skipping group the user left");
                continue;
            }
            live.push(snapshot);
        }

        let channels: Vec<ChannelKey> = live.iter().map(ConversationSnapshot::channel).collect();
        let channel_offsets = self.storage.channel_offsets_for(uid, &channels).await?;
        let mut extras = self.storage.conversation_extras_for(uid, &channels).await?;

        let mut batch = StagedBatch::new();
        let mut kept = Vec::with_capacity(live.len());
        for mut snapshot in live {
            let channel = snapshot.channel();
            let window = if channel.channel_type.is_offset_filtered() {
                OffsetWindow::new(
                    channel_offsets.get(&channel).copied(),
                    device_offsets.get(&channel).copied(),
                )
            } else {
                OffsetWindow::open()
            };
            let recents = window.retain(std::mem::take(&mut snapshot.recents), |m| m.message_seq);
            let Some(newest) = recents.iter().map(|m| m.message_seq).max() else {
                continue;
            };
            batch.record_channel(channel, newest);
            batch.record_version(snapshot.version);
            kept.push((snapshot, recents));
        }

        let all: Vec<EngineMessage> = kept
            .iter()
            .flat_map(|(_, recents)| recents.iter().cloned())
            .collect();
        let mut enriched = self.enrich(uid, &all).await?.into_iter();

        let conversations = kept
            .into_iter()
            .map(|(snapshot, recents)| {
                let channel = snapshot.channel();
                SyncConversation {
                    recents: enriched.by_ref().take(recents.len()).collect(),
                    extra: extras.remove(&channel).map(|e| e.to_view()),
                    channel_id: snapshot.channel_id,
                    channel_type: snapshot.channel_type,
                    unread: snapshot.unread,
                    timestamp: snapshot.timestamp,
                    last_msg_seq: snapshot.last_msg_seq,
                    last_client_msg_no: snapshot.last_client_msg_no,
                    offset_msg_seq: snapshot.offset_msg_seq,
                    version: snapshot.version,
                }
            })
            .collect::<Vec<_>>();

        if let Some(device) = device {
            self.on_sync_served(uid, device, batch).await;
        }
        tracing::debug!(
            uid,
            device = device.unwrap_or(""),
            %baseline,
            conversations = conversations.len(),
            "Conversation sync served"
        );
        Ok(ConversationSyncResponse {
            uid: uid.to_string(),
            conversations,
        })
    }

    /// Persist the device's staged marks.
    ///
    /// Returns `None` when nothing was staged (including a repeated ack) or
    /// when offsets are not tracked per device.
    pub async fn ack(
        &self,
        uid: &str,
        req: &ConversationSyncAckRequest,
    ) -> Result<Option<AckOutcome>> {
        if !self.per_device() {
            return Ok(None);
        }
        let device = req.device_uuid.trim();
        if device.is_empty() {
            return Err(SyncError::MissingField("device_uuid").into());
        }

        let Some(staging) = self.existing_staging(uid) else {
            tracing::debug!(uid, device, "Ack with nothing staged");
            return Ok(None);
        };
        let mut guard = staging.write().await;
        let Some(entry) = guard.devices.get_mut(device) else {
            tracing::debug!(uid, device, "Ack with nothing staged");
            return Ok(None);
        };

        let (state, actions) = entry.state.on_event(SyncEvent::AckRequested);
        entry.state = state;
        if !actions.contains(&Action::PersistStaged) {
            tracing::debug!(uid, device, "Ack with nothing staged");
            return Ok(None);
        }

        let offsets = entry.batch.offsets();
        let version = entry.batch.version();
        if let Err(e) = self.storage.persist_ack(uid, Some(device), &offsets).await {
            let (state, _) = entry.state.on_event(SyncEvent::AckFailed);
            entry.state = state;
            tracing::warn!(uid, device, error = %e, "Ack rolled back; batch stays staged");
            return Err(e.into());
        }

        let (next, actions) = entry.state.on_event(SyncEvent::AckPersisted { version });
        for action in &actions {
            if let Action::AdvanceWatermark(version) = action {
                self.advance_watermarks(uid, device, *version).await?;
            }
        }
        if actions.contains(&Action::ClearStaging) {
            entry.batch = StagedBatch::new();
            entry.staged_at = None;
        }
        entry.state = next;

        tracing::info!(uid, device, channels = offsets.len(), %version, "Sync acked");
        Ok(Some(AckOutcome {
            channels: offsets.len(),
            version,
        }))
    }

    async fn on_sync_requested(&self, uid: &str, device: &str) {
        let Some(staging) = self.existing_staging(uid) else {
            return;
        };
        let mut guard = staging.write().await;
        let Some(entry) = guard.devices.get_mut(device) else {
            return;
        };
        let (state, actions) = entry.state.on_event(SyncEvent::SyncRequested);
        entry.state = state;
        if actions.contains(&Action::InvalidateWatermark) {
            self.watermarks
                .invalidate(&device_max_version_key(uid, device));
            tracing::debug!(uid, device, "Stale device re-derives its baseline");
        }
    }

    async fn on_sync_served(&self, uid: &str, device: &str, batch: StagedBatch) {
        if batch.is_empty() {
            return;
        }
        let staging = self.user_staging(uid);
        let mut guard = staging.write().await;
        let entry = guard.devices.entry(device.to_string()).or_default();
        let (state, actions) = entry.state.on_event(SyncEvent::SyncServed {
            version: batch.version(),
        });
        entry.state = state;
        if actions.contains(&Action::StageBatch) {
            entry.batch.merge(batch);
            entry.staged_at.get_or_insert_with(Instant::now);
        }
    }

    /// Baseline for a sync: the client's version, raised to the device's
    /// acked watermark. A device seen for the first time is seeded from the
    /// user-wide watermark.
    async fn resolve_baseline(
        &self,
        uid: &str,
        device: Option<&str>,
        requested: Version,
    ) -> StorageResult<Version> {
        let Some(device) = device else {
            return Ok(requested);
        };
        let device_key = device_max_version_key(uid, device);
        let resolved = match self.watermarks.get(&device_key).await? {
            Some(version) => version,
            None => {
                let user = self
                    .watermarks
                    .get(&user_max_version_key(uid))
                    .await?
                    .unwrap_or_default();
                if !user.is_zero() {
                    self.watermarks.raise(&device_key, user).await?;
                }
                user
            }
        };
        Ok(requested.max(resolved))
    }

    async fn advance_watermarks(&self, uid: &str, device: &str, version: Version) -> StorageResult<()> {
        if version.is_zero() {
            return Ok(());
        }
        self.watermarks
            .raise(&device_max_version_key(uid, device), version)
            .await?;
        self.watermarks
            .raise(&user_max_version_key(uid), version)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Enrichment
    // ---------------------------------------------------------------------

    /// Attach extras, the requester's private flags and reactions, in order.
    async fn enrich(&self, uid: &str, messages: &[EngineMessage]) -> Result<Vec<SyncMessage>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = messages.iter().map(EngineMessage::message_id_str).collect();
        let extras = self.storage.extras_for(&ids, uid).await?;
        let user_extras = self.storage.user_extras_for(uid, &ids).await?;
        let mut reactions = self.storage.reactions_for(&ids).await?;

        Ok(messages
            .iter()
            .zip(ids)
            .map(|(message, id)| {
                let channel = client_channel(message, uid);
                let private = user_extras.get(&id);
                SyncMessage {
                    header: message.header,
                    setting: message.setting,
                    message_id: message.message_id,
                    client_msg_no: message.client_msg_no.clone(),
                    message_seq: message.message_seq,
                    from_uid: message.from_uid.clone(),
                    channel_id: channel.channel_id,
                    channel_type: channel.channel_type,
                    timestamp: message.timestamp,
                    payload: message.payload_json().unwrap_or(serde_json::Value::Null),
                    is_deleted: u8::from(private.is_some_and(|p| p.is_deleted)),
                    voice_status: u8::from(private.is_some_and(|p| p.voice_readed)),
                    reactions: reactions
                        .remove(&id)
                        .unwrap_or_default()
                        .iter()
                        .map(|r| r.to_view(uid))
                        .collect(),
                    message_extra: extras.get(&id).map(ExtraDetail::to_view),
                    message_idstr: id,
                }
            })
            .collect())
    }

    // ---------------------------------------------------------------------
    // Per-channel pulls
    // ---------------------------------------------------------------------

    /// A page of channel history, offset-filtered and enriched.
    pub async fn sync_channel_messages(
        &self,
        uid: &str,
        req: &ChannelMessageSyncRequest,
    ) -> Result<ChannelMessageSyncResponse> {
        req.validate()?;
        let channel = ChannelKey::new(req.channel_id.clone(), req.channel_type);
        let empty = ChannelMessageSyncResponse {
            start_message_seq: req.start_message_seq,
            end_message_seq: req.end_message_seq,
            pull_mode: req.pull_mode,
            messages: Vec::new(),
        };
        if channel.channel_type == ChannelType::Group
            && !self.engine.is_channel_member(&channel, uid).await?
        {
            tracing::debug!(uid, %channel, "Channel pull by non-member");
            return Ok(empty);
        }

        let page = self
            .engine
            .fetch_channel_messages(&ChannelMessagesRequest {
                login_uid: uid.to_string(),
                device_uuid: req.device_uuid.clone(),
                channel_id: channel.channel_id.clone(),
                channel_type: channel.channel_type,
                start_message_seq: req.start_message_seq,
                end_message_seq: req.end_message_seq,
                limit: if req.limit == 0 {
                    self.config.default_msg_count
                } else {
                    req.limit
                },
                pull_mode: req.pull_mode,
            })
            .await?;

        let window = if channel.channel_type.is_offset_filtered() {
            let channel_offset = self.storage.channel_offset(uid, &channel).await?;
            let device_offset = match self.device_scope(&req.device_uuid) {
                Some(device) => self
                    .storage
                    .device_offsets(uid, device)
                    .await?
                    .get(&channel)
                    .copied(),
                None => None,
            };
            OffsetWindow::new(channel_offset, device_offset)
        } else {
            OffsetWindow::open()
        };
        let messages = window.retain(page.messages, |m| m.message_seq);

        Ok(ChannelMessageSyncResponse {
            start_message_seq: page.start_message_seq,
            end_message_seq: page.end_message_seq,
            pull_mode: page.pull_mode,
            messages: self.enrich(uid, &messages).await?,
        })
    }

    /// Message extras of a channel changed after the effective baseline.
    ///
    /// Each (uid, source, channel) keeps a watermark; a lower client version
    /// is raised to it, a higher one raises it.
    pub async fn sync_message_extras(
        &self,
        uid: &str,
        req: &MessageExtraSyncRequest,
    ) -> Result<Vec<MessageExtraView>> {
        req.validate()?;
        let channel = ChannelKey::new(req.channel_id.clone(), req.channel_type).storage_key(uid);
        let key = message_extra_version_key(uid, &req.source, &channel);
        let baseline = self.watermarks.raise(&key, req.extra_version).await?;
        let limit = SyncConfig::clamp_limit(
            req.limit,
            self.config.extra_default_limit,
            self.config.extra_max_limit,
        );

        let records = self.storage.sync_extras(&channel, baseline, limit).await?;
        let ids: Vec<String> = records.iter().map(|r| r.message_id.clone()).collect();
        let details = self.storage.extras_for(&ids, uid).await?;
        Ok(records
            .iter()
            .map(|record| match details.get(&record.message_id) {
                Some(detail) => detail.to_view(),
                None => record.to_view(),
            })
            .collect())
    }

    /// Reactions of a channel changed after `seq`.
    pub async fn sync_reactions(
        &self,
        uid: &str,
        req: &ReactionSyncRequest,
    ) -> Result<Vec<ReactionView>> {
        req.validate()?;
        let channel = ChannelKey::new(req.channel_id.clone(), req.channel_type).storage_key(uid);
        let limit = SyncConfig::clamp_limit(
            req.limit,
            self.config.reaction_default_limit,
            self.config.reaction_max_limit,
        );
        let records = self.storage.sync_reactions(&channel, req.seq, limit).await?;
        Ok(records.iter().map(|r| r.to_view(uid)).collect())
    }

    /// Conversation UI state of `uid` changed after the requested version.
    pub async fn sync_conversation_extras(
        &self,
        uid: &str,
        req: &ConversationExtraSyncRequest,
    ) -> Result<Vec<ConversationExtraView>> {
        let records = self
            .storage
            .sync_conversation_extras(uid, req.version)
            .await?;
        Ok(records.iter().map(|r| r.to_view()).collect())
    }

    /// Store conversation UI state for one channel.
    pub async fn upsert_conversation_extra(
        &self,
        uid: &str,
        channel: &ChannelKey,
        req: &ConversationExtraRequest,
    ) -> Result<ConversationExtraView> {
        if channel.channel_id.trim().is_empty() {
            return Err(SyncError::MissingField("channel_id").into());
        }
        let record = self
            .storage
            .upsert_conversation_extra(
                uid,
                channel,
                &ConversationExtraUpdate {
                    browse_to: req.browse_to,
                    keep_message_seq: req.keep_message_seq,
                    keep_offset_y: req.keep_offset_y,
                    draft: req.draft.clone(),
                },
            )
            .await?;
        Ok(record.to_view())
    }

    /// Merge the user's last acknowledged offsets into one device.
    ///
    /// Used when a deployment switches to per-device offsets, so existing
    /// devices do not start from an empty window. Returns the channels merged.
    pub async fn reconcile_device(&self, uid: &str, req: &DeviceReconcileRequest) -> Result<u64> {
        req.validate()?;
        let device = req.device_uuid.trim();
        let merged = self.storage.reconcile_device_offsets(uid, device).await?;
        tracing::info!(uid, device, merged, "Device offsets reconciled");
        Ok(merged)
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Drop batches staged longer than `timeout` without an ack, then forget
    /// every device that has nothing staged.
    ///
    /// An expired device re-derives its baseline from the persisted
    /// watermark on its next sync. Returns the number of batches dropped.
    pub async fn expire_stale(&self, timeout: Duration) -> usize {
        let users: Vec<(String, Arc<RwLock<UserStaging>>)> = self
            .staging
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut expired = 0;
        for (uid, staging) in users {
            let mut guard = staging.write().await;
            for (device, entry) in guard.devices.iter_mut() {
                let overdue = entry
                    .staged_at
                    .is_some_and(|staged_at| staged_at.elapsed() >= timeout);
                if !overdue {
                    continue;
                }
                let (state, actions) = entry.state.on_event(SyncEvent::AckTimedOut);
                entry.state = state;
                if actions.contains(&Action::ClearStaging) {
                    entry.batch = StagedBatch::new();
                    entry.staged_at = None;
                    self.watermarks
                        .invalidate(&device_max_version_key(&uid, device));
                    expired += 1;
                    tracing::info!(uid = %uid, device = %device, "Staged batch expired without ack");
                }
            }
            guard.devices.retain(|_, entry| entry.state.is_awaiting_ack());
            if guard.devices.is_empty() {
                drop(guard);
                self.staging
                    .remove_if(&uid, |_, value| Arc::strong_count(value) == 2);
            }
        }
        expired
    }

    /// Cached version watermarks.
    pub fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }

    /// Number of device batches waiting for an ack.
    pub fn staged_batches(&self) -> usize {
        self.staging
            .iter()
            .map(|entry| {
                entry
                    .value()
                    .try_read()
                    .map(|g| g.devices.values().filter(|d| d.state.is_awaiting_ack()).count())
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Number of users with staging state.
    pub fn staged_users(&self) -> usize {
        self.staging.len()
    }

    /// Sync state of one device.
    pub async fn device_state(&self, uid: &str, device_uuid: &str) -> DeviceSyncState {
        match self.existing_staging(uid) {
            Some(staging) => staging
                .read()
                .await
                .devices
                .get(device_uuid)
                .map(|d| d.state)
                .unwrap_or_default(),
            None => DeviceSyncState::ColdStart,
        }
    }
}
