//! HTTP request and response bodies.
//!
//! Field names follow the JSON the mobile and desktop clients already speak,
//! which is why several booleans travel as `0`/`1` integers.

use crate::engine::{MessageHeader, PullMode};
use crate::channel::validate_uid;
use crate::error::SyncError;
use crate::ids::{ChannelKey, ChannelType, ReminderType, Version};
use serde::{Deserialize, Serialize};

fn require(value: &str, field: &'static str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        Err(SyncError::MissingField(field))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Conversation sync
// ---------------------------------------------------------------------------

/// `POST /v1/conversation/sync`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSyncRequest {
    /// Highest conversation version the device has.
    #[serde(default)]
    pub version: Version,
    /// Device-reported last seqs, `channel:type:seq|...`.
    #[serde(default)]
    pub last_msg_seqs: String,
    /// Recent messages per conversation (0 = server default).
    #[serde(default)]
    pub msg_count: u32,
    /// Device identifier.
    #[serde(default)]
    pub device_uuid: String,
}

/// `POST /v1/conversation/syncack`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSyncAckRequest {
    /// Command version the device processed.
    #[serde(default)]
    pub cmd_version: u64,
    /// Device identifier.
    #[serde(default)]
    pub device_uuid: String,
}

/// `POST /v1/conversation/device/reconcile`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceReconcileRequest {
    /// Device to seed from the user's last acknowledged offsets.
    #[serde(default)]
    pub device_uuid: String,
}

impl DeviceReconcileRequest {
    /// Reject requests without a device.
    pub fn validate(&self) -> Result<(), SyncError> {
        require(&self.device_uuid, "device_uuid")
    }
}

/// Response of `POST /v1/conversation/sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSyncResponse {
    /// Requesting user.
    pub uid: String,
    /// Conversations with surviving recents.
    pub conversations: Vec<SyncConversation>,
}

/// One conversation in a sync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConversation {
    /// Channel id from the requester's perspective.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Unread count.
    pub unread: i64,
    /// Time of the last message in seconds.
    pub timestamp: i64,
    /// Seq of the newest message.
    pub last_msg_seq: u64,
    /// Client number of the newest message.
    pub last_client_msg_no: String,
    /// Seq below which history is hidden.
    pub offset_msg_seq: u64,
    /// Conversation version.
    pub version: Version,
    /// Recent messages after offset filtering, newest first.
    pub recents: Vec<SyncMessage>,
    /// UI continuation state.
    pub extra: Option<ConversationExtraView>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message enriched with extras and reactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Delivery flags.
    pub header: MessageHeader,
    /// Packed setting bits.
    pub setting: u8,
    /// Numeric message id.
    pub message_id: i64,
    /// Message id as a string (JavaScript clients lose precision on i64).
    pub message_idstr: String,
    /// Client idempotency number.
    pub client_msg_no: String,
    /// Seq inside the channel.
    pub message_seq: u64,
    /// Sender.
    pub from_uid: String,
    /// Channel id from the requester's perspective.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Server timestamp in seconds.
    pub timestamp: i64,
    /// Decoded payload (`null` if it was not JSON).
    pub payload: serde_json::Value,
    /// 1 when the requester deleted the message for themselves.
    pub is_deleted: u8,
    /// 1 when the requester listened to this voice message.
    pub voice_status: u8,
    /// Reactions, including soft-deleted ones so clients can retract.
    pub reactions: Vec<ReactionView>,
    /// Channel-global mutable facts.
    pub message_extra: Option<MessageExtraView>,
}

/// Channel-global message extra as seen by one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageExtraView {
    /// Message id.
    pub message_id: String,
    /// Seq of the message.
    pub message_seq: u64,
    /// 1 when revoked.
    pub revoke: u8,
    /// Uid that revoked it.
    pub revoker: String,
    /// 1 when the requester has read it.
    pub readed: u8,
    /// When the requester read it (seconds, 0 if unread).
    pub readed_at: i64,
    /// Number of readers.
    pub readed_count: i64,
    /// 1 when deleted for everyone.
    pub is_mutual_deleted: u8,
    /// 1 when pinned.
    pub is_pinned: u8,
    /// Edited content (JSON text), empty when never edited.
    pub content_edit: String,
    /// When the last edit happened (seconds).
    pub edited_at: i64,
    /// Version of this row.
    pub extra_version: Version,
}

/// A reaction row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionView {
    /// Message reacted to.
    pub message_id: String,
    /// Reacting user.
    pub uid: String,
    /// Display name of the reacting user.
    pub name: String,
    /// Channel id from the requester's perspective.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Per-channel reaction seq.
    pub seq: u64,
    /// Emoji.
    pub emoji: String,
    /// 1 when retracted.
    pub is_deleted: u8,
}

/// `POST /v1/message/channel/sync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessageSyncRequest {
    /// Channel id.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// First seq of the window.
    #[serde(default)]
    pub start_message_seq: u64,
    /// Last seq of the window.
    #[serde(default)]
    pub end_message_seq: u64,
    /// Page size.
    #[serde(default)]
    pub limit: u32,
    /// Pull direction.
    #[serde(default)]
    pub pull_mode: PullMode,
    /// Device identifier.
    #[serde(default)]
    pub device_uuid: String,
}

impl ChannelMessageSyncRequest {
    /// Reject requests without a channel.
    pub fn validate(&self) -> Result<(), SyncError> {
        require(&self.channel_id, "channel_id")
    }
}

/// Response of `POST /v1/message/channel/sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessageSyncResponse {
    /// First seq covered.
    pub start_message_seq: u64,
    /// Last seq covered.
    pub end_message_seq: u64,
    /// Pull direction.
    pub pull_mode: PullMode,
    /// Messages after offset filtering.
    pub messages: Vec<SyncMessage>,
}

// ---------------------------------------------------------------------------
// Extras
// ---------------------------------------------------------------------------

/// `POST /v1/message/extra/sync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageExtraSyncRequest {
    /// Channel id.
    #[serde(default)]
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Highest extra version the client has.
    #[serde(default)]
    pub extra_version: Version,
    /// Which client surface is asking (each keeps its own watermark).
    #[serde(default)]
    pub source: String,
    /// Page size (0 = server default).
    #[serde(default)]
    pub limit: u32,
}

impl MessageExtraSyncRequest {
    /// Reject requests without a channel.
    pub fn validate(&self) -> Result<(), SyncError> {
        require(&self.channel_id, "channel_id")
    }
}

/// Identifies one message inside its channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    /// Message id.
    pub message_id: String,
    /// Seq of the message.
    #[serde(default)]
    pub message_seq: u64,
    /// Channel id as the client addresses it.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
}

impl MessageRef {
    /// Channel the message lives in, as the client addresses it.
    pub fn channel(&self) -> ChannelKey {
        ChannelKey::new(self.channel_id.clone(), self.channel_type)
    }

    /// Reject refs without ids.
    pub fn validate(&self) -> Result<(), SyncError> {
        require(&self.message_id, "message_id")?;
        require(&self.channel_id, "channel_id")
    }
}

/// `POST /v1/message/revoke`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeRequest {
    /// Message being revoked.
    #[serde(flatten)]
    pub message: MessageRef,
    /// Client number of the message.
    #[serde(default)]
    pub client_msg_no: String,
}

/// `POST /v1/message/edit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRequest {
    /// Message being edited.
    #[serde(flatten)]
    pub message: MessageRef,
    /// New content (JSON text).
    #[serde(default)]
    pub content_edit: String,
}

impl EditRequest {
    /// Reject edits without a target or content.
    pub fn validate(&self) -> Result<(), SyncError> {
        self.message.validate()?;
        require(&self.content_edit, "content_edit")
    }
}

/// `POST /v1/message/readed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadedRequest {
    /// Channel id.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Messages read, with their seqs.
    #[serde(default)]
    pub messages: Vec<ReadedMessage>,
}

/// A message marked as read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadedMessage {
    /// Message id.
    pub message_id: String,
    /// Seq of the message.
    #[serde(default)]
    pub message_seq: u64,
}

impl ReadedRequest {
    /// Reject empty batches.
    pub fn validate(&self) -> Result<(), SyncError> {
        require(&self.channel_id, "channel_id")?;
        if self.messages.is_empty() {
            return Err(SyncError::MissingField("messages"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reactions
// ---------------------------------------------------------------------------

/// `POST /v1/reactions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRequest {
    /// Message reacted to.
    pub message_id: String,
    /// Channel id as the client addresses it.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Emoji.
    pub emoji: String,
    /// Display name of the reacting user.
    #[serde(default)]
    pub name: String,
}

impl ReactionRequest {
    /// Reject toggles without a target or emoji.
    pub fn validate(&self) -> Result<(), SyncError> {
        require(&self.message_id, "message_id")?;
        require(&self.channel_id, "channel_id")?;
        require(&self.emoji, "emoji")
    }
}

/// Result of a reaction toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionToggleResponse {
    /// 1 when the toggle left the reaction retracted.
    pub is_deleted: u8,
    /// Emoji now stored on the row.
    pub emoji: String,
    /// Seq assigned to this toggle.
    pub seq: u64,
}

/// `POST /v1/reaction/sync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionSyncRequest {
    /// Channel id.
    #[serde(default)]
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Highest reaction seq the client has.
    #[serde(default)]
    pub seq: u64,
    /// Page size (0 = server default).
    #[serde(default)]
    pub limit: u32,
}

impl ReactionSyncRequest {
    /// Reject requests without a channel.
    pub fn validate(&self) -> Result<(), SyncError> {
        require(&self.channel_id, "channel_id")
    }
}

// ---------------------------------------------------------------------------
// Reminders
// ---------------------------------------------------------------------------

/// `POST /v1/message/reminder/sync`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReminderSyncRequest {
    /// Highest reminder version the client has.
    #[serde(default)]
    pub version: Version,
    /// Page size (0 = server default).
    #[serde(default)]
    pub limit: u32,
    /// Channels whose broadcast reminders the client wants.
    #[serde(default)]
    pub channel_ids: Vec<String>,
}

/// A reminder as returned to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderView {
    /// Reminder id.
    pub id: i64,
    /// Channel id.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Uid that caused the reminder.
    pub publisher: String,
    /// Seq of the originating message.
    pub message_seq: u64,
    /// Id of the originating message.
    pub message_id: String,
    /// Kind of reminder.
    pub reminder_type: ReminderType,
    /// Target uid, empty for everyone in the channel.
    pub uid: String,
    /// Display text.
    pub text: String,
    /// Extra data.
    pub data: Option<serde_json::Value>,
    /// 1 when the client should jump to the message.
    pub is_locate: u8,
    /// Version of this row.
    pub version: Version,
    /// 1 when the requester marked it done.
    pub done: u8,
}

// ---------------------------------------------------------------------------
// Conversation extras
// ---------------------------------------------------------------------------

/// `POST /v1/conversation/extra/sync`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationExtraSyncRequest {
    /// Highest conversation-extra version the client has.
    #[serde(default)]
    pub version: Version,
}

/// `POST /v1/conversations/{channel_id}/{channel_type}/extra`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationExtraRequest {
    /// Highest seq the user has scrolled to.
    #[serde(default)]
    pub browse_to: u64,
    /// Seq of the message kept at the viewport anchor.
    #[serde(default)]
    pub keep_message_seq: u64,
    /// Pixel offset of the viewport anchor.
    #[serde(default)]
    pub keep_offset_y: i64,
    /// Unsent draft.
    #[serde(default)]
    pub draft: String,
}

/// UI continuation state for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationExtraView {
    /// Channel id from the requester's perspective.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Highest seq the user has scrolled to.
    pub browse_to: u64,
    /// Seq of the message kept at the viewport anchor.
    pub keep_message_seq: u64,
    /// Pixel offset of the viewport anchor.
    pub keep_offset_y: i64,
    /// Unsent draft.
    pub draft: String,
    /// Version of this row.
    pub version: Version,
}

// ---------------------------------------------------------------------------
// Offsets
// ---------------------------------------------------------------------------

/// `POST /v1/message/offset`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetRequest {
    /// Channel id.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Seq up to which history is cleared.
    pub message_seq: u64,
}

impl OffsetRequest {
    /// Reject requests without a channel.
    pub fn validate(&self) -> Result<(), SyncError> {
        require(&self.channel_id, "channel_id")
    }
}

/// `POST /v1/message/members/offset`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberOffsetRequest {
    /// Group id.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Members that (re)joined.
    pub uids: Vec<String>,
    /// Whether joining members may read older history.
    #[serde(default)]
    pub history_visible: bool,
    /// Current highest seq of the channel.
    #[serde(default)]
    pub channel_max_seq: u64,
}

impl MemberOffsetRequest {
    /// Reject requests without a channel or members.
    pub fn validate(&self) -> Result<(), SyncError> {
        require(&self.channel_id, "channel_id")?;
        if self.uids.is_empty() {
            return Err(SyncError::MissingField("uids"));
        }
        self.uids.iter().try_for_each(|uid| validate_uid(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_request_defaults() {
        let req: ConversationSyncRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.version, Version::zero());
        assert!(req.device_uuid.is_empty());
        assert_eq!(req.msg_count, 0);
    }

    #[test]
    fn revoke_request_flattens_message_ref() {
        let req: RevokeRequest = serde_json::from_str(
            r#"{"message_id":"42","message_seq":3,"channel_id":"g1","channel_type":2,"client_msg_no":"c-1"}"#,
        )
        .unwrap();
        assert_eq!(req.message.message_id, "42");
        assert_eq!(req.message.channel(), ChannelKey::group("g1"));
        assert_eq!(req.client_msg_no, "c-1");
    }

    #[test]
    fn blank_channel_fails_validation() {
        let req = MessageExtraSyncRequest {
            channel_id: "  ".into(),
            channel_type: ChannelType::Group,
            extra_version: Version::zero(),
            source: String::new(),
            limit: 0,
        };
        assert!(matches!(
            req.validate(),
            Err(SyncError::MissingField("channel_id"))
        ));
    }

    #[test]
    fn edit_requires_content() {
        let req = EditRequest {
            message: MessageRef {
                message_id: "1".into(),
                message_seq: 1,
                channel_id: "g1".into(),
                channel_type: ChannelType::Group,
            },
            content_edit: String::new(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn readed_requires_messages() {
        let req = ReadedRequest {
            channel_id: "g1".into(),
            channel_type: ChannelType::Group,
            messages: vec![],
        };
        assert!(matches!(req.validate(), Err(SyncError::MissingField("messages"))));
    }

    #[test]
    fn reaction_requires_emoji() {
        let req = ReactionRequest {
            message_id: "1".into(),
            channel_id: "g1".into(),
            channel_type: ChannelType::Group,
            emoji: "".into(),
            name: "Alice".into(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn member_offset_requires_uids() {
        let req = MemberOffsetRequest {
            channel_id: "g1".into(),
            channel_type: ChannelType::Group,
            uids: vec![],
            history_visible: false,
            channel_max_seq: 10,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn member_offset_rejects_separator_in_uids() {
        let mut req = MemberOffsetRequest {
            channel_id: "g1".into(),
            channel_type: ChannelType::Group,
            uids: vec!["alice".into(), "bob@example.com".into()],
            history_visible: false,
            channel_max_seq: 10,
        };
        assert!(matches!(req.validate(), Err(SyncError::InvalidUid(_))));
        req.uids.pop();
        assert!(req.validate().is_ok());
    }
}
