//! Storage layer for convsync-server.
//!
//! One SQLite database holds every store. Each store is a trait implemented
//! by [`SqliteStorage`]; multi-store operations (revoke + reminder cancel,
//! offset advance + reminder done) run in one transaction inside the storage
//! layer so partial application is never visible.
//!
//! Every versioned write allocates its version from the sequencer inside the
//! same transaction as the write, so a rolled-back write never leaves a
//! version gap that a concurrent reader could skip past.

mod conversation_extra;
mod extra;
mod offsets;
mod reaction;
mod reminder;
mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageResult;
use async_trait::async_trait;
use std::collections::HashMap;
use sync_core::{ReactionChange, ReminderDraft};
use sync_types::api::{
    ConversationExtraView, MessageExtraView, MessageRef, ReactionView, ReadedMessage,
    ReminderView,
};
use sync_types::{ChannelKey, ReminderType, Version};

/// Sequencer key for message extras of a channel.
pub fn extra_sequence_key(channel: &ChannelKey) -> String {
    format!(
        "messageExtra:{}:{}",
        channel.channel_id,
        channel.channel_type.as_u8()
    )
}

/// Sequencer key for reactions of a channel.
pub fn reaction_sequence_key(channel: &ChannelKey) -> String {
    format!(
        "messageReactionSeq:{}:{}",
        channel.channel_id,
        channel.channel_type.as_u8()
    )
}

/// Sequencer key shared by all reminders.
pub const REMINDER_SEQUENCE_KEY: &str = "reminders";

/// Sequencer key shared by all conversation extras.
pub const CONVERSATION_EXTRA_SEQUENCE_KEY: &str = "conversationExtra";

/// Channel-global mutable facts about one message.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraRecord {
    /// Message id.
    pub message_id: String,
    /// Message seq in its channel.
    pub message_seq: u64,
    /// Storage key of the channel.
    pub channel: ChannelKey,
    /// Sender of the message, when known.
    pub from_uid: String,
    /// Whether the message was revoked.
    pub revoke: bool,
    /// Who revoked it.
    pub revoker: String,
    /// Number of distinct members who read it.
    pub readed_count: i64,
    /// Edited content, empty when never edited.
    pub content_edit: String,
    /// SHA-256 hex of `content_edit`.
    pub content_edit_hash: String,
    /// Unix seconds of the last edit.
    pub edited_at: i64,
    /// Whether the message is pinned.
    pub is_pinned: bool,
    /// Whether the message was deleted for everyone.
    pub is_deleted: bool,
    /// Version of the last mutation.
    pub version: Version,
}

/// An extra row plus the requester's own read state.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraDetail {
    /// Channel-global facts.
    pub extra: ExtraRecord,
    /// Whether the requester read the message.
    pub readed: bool,
    /// When the requester read it (unix seconds, 0 when unread).
    pub readed_at: i64,
}

impl ExtraDetail {
    /// Client-facing view.
    pub fn to_view(&self) -> MessageExtraView {
        let mut view = self.extra.to_view();
        view.readed = u8::from(self.readed);
        view.readed_at = self.readed_at;
        view
    }
}

impl ExtraRecord {
    /// Client-facing view without per-user state.
    pub fn to_view(&self) -> MessageExtraView {
        MessageExtraView {
            message_id: self.message_id.clone(),
            message_seq: self.message_seq,
            revoke: u8::from(self.revoke),
            revoker: self.revoker.clone(),
            readed: 0,
            readed_at: 0,
            readed_count: self.readed_count,
            is_mutual_deleted: u8::from(self.is_deleted),
            is_pinned: u8::from(self.is_pinned),
            content_edit: self.content_edit.clone(),
            edited_at: self.edited_at,
            extra_version: self.version,
        }
    }
}

/// Facts about a message that are private to one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserExtraRecord {
    /// Message id.
    pub message_id: String,
    /// Whether the user deleted the message for themselves.
    pub is_deleted: bool,
    /// Whether the user played the voice message.
    pub voice_readed: bool,
}

/// Result of an edit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The edit was stored under a new version.
    Applied(Version),
    /// Identical content was already stored; nothing changed.
    Unchanged,
}

/// A user's reaction to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRecord {
    /// Message id.
    pub message_id: String,
    /// Reacting user.
    pub uid: String,
    /// Display name of the reacting user.
    pub name: String,
    /// Storage key of the channel.
    pub channel: ChannelKey,
    /// Emoji.
    pub emoji: String,
    /// Per-channel sequence of the last toggle.
    pub seq: u64,
    /// Whether the reaction is retracted.
    pub is_deleted: bool,
}

impl ReactionRecord {
    /// Client-facing view, with the channel mapped back for `viewer`.
    pub fn to_view(&self, viewer: &str) -> ReactionView {
        let channel = self.channel.client_key(viewer);
        ReactionView {
            message_id: self.message_id.clone(),
            uid: self.uid.clone(),
            name: self.name.clone(),
            channel_id: channel.channel_id,
            channel_type: channel.channel_type,
            seq: self.seq,
            emoji: self.emoji.clone(),
            is_deleted: u8::from(self.is_deleted),
        }
    }
}

/// Outcome of a reaction toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionToggled {
    /// What the toggle did.
    pub change: ReactionChange,
    /// The row after the toggle.
    pub record: ReactionRecord,
}

/// A stored reminder as seen by one user.
#[derive(Debug, Clone, PartialEq)]
pub struct ReminderRecord {
    /// Row id.
    pub id: i64,
    /// Channel of the originating message.
    pub channel: ChannelKey,
    /// Client number of the originating message.
    pub client_msg_no: String,
    /// Originating message id.
    pub message_id: String,
    /// Originating message seq.
    pub message_seq: u64,
    /// Kind of reminder.
    pub reminder_type: ReminderType,
    /// Target uid, empty for every member.
    pub uid: String,
    /// Display text.
    pub text: String,
    /// Extra JSON data.
    pub data: Option<serde_json::Value>,
    /// Whether the client should jump to the message.
    pub is_locate: bool,
    /// Uid that caused the reminder.
    pub publisher: String,
    /// Version of the last change.
    pub version: Version,
    /// Whether the reminder was retracted.
    pub is_deleted: bool,
}

impl ReminderRecord {
    /// Client-facing view. Retracted reminders are reported as done.
    pub fn to_view(&self) -> ReminderView {
        ReminderView {
            id: self.id,
            channel_id: self.channel.channel_id.clone(),
            channel_type: self.channel.channel_type,
            publisher: self.publisher.clone(),
            message_seq: self.message_seq,
            message_id: self.message_id.clone(),
            reminder_type: self.reminder_type,
            uid: self.uid.clone(),
            text: self.text.clone(),
            data: self.data.clone(),
            is_locate: u8::from(self.is_locate),
            version: self.version,
            done: u8::from(self.is_deleted),
        }
    }
}

/// Fields written by a conversation-extra upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationExtraUpdate {
    /// Highest seq browsed; merged with max.
    pub browse_to: u64,
    /// Message to keep in view.
    pub keep_message_seq: u64,
    /// Scroll offset of the kept message.
    pub keep_offset_y: i64,
    /// Unsent draft.
    pub draft: String,
}

/// Per-(user, channel) UI state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationExtraRecord {
    /// Owner.
    pub uid: String,
    /// Channel as the owner addresses it.
    pub channel: ChannelKey,
    /// Highest seq browsed.
    pub browse_to: u64,
    /// Message to keep in view.
    pub keep_message_seq: u64,
    /// Scroll offset of the kept message.
    pub keep_offset_y: i64,
    /// Unsent draft.
    pub draft: String,
    /// Version of the last write.
    pub version: Version,
}

impl ConversationExtraRecord {
    /// Client-facing view.
    pub fn to_view(&self) -> ConversationExtraView {
        ConversationExtraView {
            channel_id: self.channel.channel_id.clone(),
            channel_type: self.channel.channel_type,
            browse_to: self.browse_to,
            keep_message_seq: self.keep_message_seq,
            keep_offset_y: self.keep_offset_y,
            draft: self.draft.clone(),
            version: self.version,
        }
    }
}

/// Monotonic per-key counter.
#[async_trait]
pub trait VersionSequencer: Send + Sync {
    /// Issue the next value for `key`. The first value is 1.
    async fn next_version(&self, key: &str) -> StorageResult<Version>;
}

/// Durable max-merged watermarks.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Stored watermark for `key`.
    async fn load_watermark(&self, key: &str) -> StorageResult<Option<Version>>;

    /// Raise the watermark to at least `version`; returns the stored value.
    async fn raise_watermark(&self, key: &str, version: Version) -> StorageResult<Version>;
}

/// Channel, device and user-last offsets.
///
/// Every advance is a single max-merge upsert: applying the same or an older
/// seq never lowers the stored value.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Merge `seq` into the user's channel offset.
    async fn advance_channel_offset(
        &self,
        uid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<()>;

    /// Merge `seq` into one device's offset.
    async fn advance_device_offset(
        &self,
        uid: &str,
        device_uuid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<()>;

    /// Merge `seq` into the user's last acknowledged offset.
    async fn advance_user_last_offset(
        &self,
        uid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<()>;

    /// Effective channel offset for `uid`: the user's row and the channel-wide
    /// row (empty uid), whichever is larger.
    async fn channel_offset(&self, uid: &str, channel: &ChannelKey)
        -> StorageResult<Option<u64>>;

    /// [`OffsetStore::channel_offset`] for many channels at once.
    async fn channel_offsets_for(
        &self,
        uid: &str,
        channels: &[ChannelKey],
    ) -> StorageResult<HashMap<ChannelKey, u64>>;

    /// All offsets recorded for one device.
    async fn device_offsets(
        &self,
        uid: &str,
        device_uuid: &str,
    ) -> StorageResult<HashMap<ChannelKey, u64>>;

    /// All last-acknowledged offsets of a user.
    async fn user_last_offsets(&self, uid: &str) -> StorageResult<HashMap<ChannelKey, u64>>;

    /// Device offsets, seeding them from the user's last offsets the first
    /// time the device is seen. The seed is persisted, so it happens once.
    async fn device_offsets_or_seed(
        &self,
        uid: &str,
        device_uuid: &str,
    ) -> StorageResult<HashMap<ChannelKey, u64>>;

    /// Persist an acknowledged batch in one transaction: user-last offsets
    /// always, device offsets when `device_uuid` is given.
    async fn persist_ack(
        &self,
        uid: &str,
        device_uuid: Option<&str>,
        offsets: &[(ChannelKey, u64)],
    ) -> StorageResult<()>;

    /// Overwrite a channel offset (delete then insert). The only
    /// non-monotone write, used when a member rejoins.
    async fn reset_channel_offset(
        &self,
        uid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<()>;

    /// Merge every user-last offset into the device's offsets.
    ///
    /// Returns the number of channels merged.
    async fn reconcile_device_offsets(&self, uid: &str, device_uuid: &str) -> StorageResult<u64>;

    /// Advance the channel offset and mark the user's reminders up to `seq`
    /// done, in one transaction.
    ///
    /// Returns `false` without writing when the stored offset is already at
    /// or above `seq`.
    async fn clear_channel(
        &self,
        uid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<bool>;
}

/// Channel-global and per-user message extras.
#[async_trait]
pub trait ExtraStore: Send + Sync {
    /// Mark a message revoked, unpin it and retract its reminders, in one
    /// transaction.
    async fn revoke_message(&self, revoker: &str, message: &MessageRef) -> StorageResult<Version>;

    /// Record that `uid` read `messages`. Only first reads bump the counter.
    ///
    /// Returns the number of messages newly read.
    async fn mark_read(
        &self,
        uid: &str,
        channel: &ChannelKey,
        messages: &[ReadedMessage],
    ) -> StorageResult<u64>;

    /// Store edited content unless identical content is already stored.
    async fn set_edit(&self, message: &MessageRef, content: &str) -> StorageResult<EditOutcome>;

    /// Set the pin flag.
    async fn set_pinned(&self, message: &MessageRef, pinned: bool) -> StorageResult<Version>;

    /// Flip the pin flag; returns the new flag and version.
    async fn toggle_pinned(&self, message: &MessageRef) -> StorageResult<(bool, Version)>;

    /// Delete a message for every member.
    async fn mark_mutual_deleted(&self, message: &MessageRef) -> StorageResult<Version>;

    /// Delete messages for `uid` only, in one transaction.
    async fn mark_user_deleted(&self, uid: &str, messages: &[MessageRef]) -> StorageResult<()>;

    /// Record that `uid` played a voice message.
    async fn mark_voice_read(&self, uid: &str, message: &MessageRef) -> StorageResult<()>;

    /// Extras of a channel changed after `version`, ascending.
    ///
    /// At version 0 the newest `limit` rows are returned (still ascending).
    async fn sync_extras(
        &self,
        channel: &ChannelKey,
        version: Version,
        limit: u32,
    ) -> StorageResult<Vec<ExtraRecord>>;

    /// Extras of the given messages with `uid`'s read state.
    async fn extras_for(
        &self,
        message_ids: &[String],
        uid: &str,
    ) -> StorageResult<HashMap<String, ExtraDetail>>;

    /// `uid`'s private flags on the given messages.
    async fn user_extras_for(
        &self,
        uid: &str,
        message_ids: &[String],
    ) -> StorageResult<HashMap<String, UserExtraRecord>>;
}

/// Per-(message, user) reactions.
#[async_trait]
pub trait ReactionStore: Send + Sync {
    /// Toggle `emoji` for `uid` on a message.
    async fn toggle_reaction(
        &self,
        uid: &str,
        name: &str,
        channel: &ChannelKey,
        message_id: &str,
        emoji: &str,
    ) -> StorageResult<ReactionToggled>;

    /// Reactions of a channel changed after `seq`, ascending.
    async fn sync_reactions(
        &self,
        channel: &ChannelKey,
        seq: u64,
        limit: u32,
    ) -> StorageResult<Vec<ReactionRecord>>;

    /// Reactions (including retracted ones) on the given messages.
    async fn reactions_for(
        &self,
        message_ids: &[String],
    ) -> StorageResult<HashMap<String, Vec<ReactionRecord>>>;
}

/// Reminders and their per-user completion.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    /// Persist derived reminders in one transaction, each with a fresh
    /// version. Re-delivered messages do not create duplicates.
    ///
    /// Returns the number of reminders created.
    async fn insert_reminders(&self, drafts: &[ReminderDraft]) -> StorageResult<u64>;

    /// Retract every reminder of a message.
    async fn cancel_for_message(&self, channel: &ChannelKey, message_id: &str)
        -> StorageResult<u64>;

    /// Retract every reminder targeting `uid` in a channel.
    async fn cancel_for_channel_user(&self, uid: &str, channel: &ChannelKey)
        -> StorageResult<u64>;

    /// Reminders visible to `uid` changed after `version`, ascending.
    ///
    /// Broadcast reminders are limited to `channel_ids` when it is not empty.
    /// Reminders `uid` marked done are never returned; retracted ones are
    /// returned only to incremental (non-zero version) syncs.
    async fn sync_reminders(
        &self,
        uid: &str,
        version: Version,
        channel_ids: &[String],
        limit: u32,
    ) -> StorageResult<Vec<ReminderRecord>>;

    /// Mark reminders done for `uid`, bumping their versions.
    async fn mark_done(&self, ids: &[i64], uid: &str) -> StorageResult<u64>;
}

/// Per-(user, channel) UI state.
#[async_trait]
pub trait ConversationExtraStore: Send + Sync {
    /// Merge `update` into the user's state for a channel.
    async fn upsert_conversation_extra(
        &self,
        uid: &str,
        channel: &ChannelKey,
        update: &ConversationExtraUpdate,
    ) -> StorageResult<ConversationExtraRecord>;

    /// Every row of `uid` changed after `version`, ascending.
    async fn sync_conversation_extras(
        &self,
        uid: &str,
        version: Version,
    ) -> StorageResult<Vec<ConversationExtraRecord>>;

    /// Rows of `uid` for the given channels.
    async fn conversation_extras_for(
        &self,
        uid: &str,
        channels: &[ChannelKey],
    ) -> StorageResult<HashMap<ChannelKey, ConversationExtraRecord>>;
}
