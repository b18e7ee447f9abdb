//! Payloads exchanged with the external IM engine.
//!
//! The engine owns message persistence and fan-out. These types mirror its
//! JSON API: message payloads travel as standard base64.

use crate::error::SyncError;
use crate::ids::{ChannelKey, ChannelType, Version};
use serde::{Deserialize, Serialize};

/// Per-message delivery flags set by the sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Message is not persisted by the engine.
    #[serde(default)]
    pub no_persist: u8,
    /// Message should raise a red dot on the conversation.
    #[serde(default)]
    pub red_dot: u8,
    /// Message is consumed once and never re-synced.
    #[serde(default)]
    pub sync_once: u8,
}

/// A message as stored and returned by the IM engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMessage {
    /// Delivery flags.
    #[serde(default)]
    pub header: MessageHeader,
    /// Packed setting bits (receipt, no-conversation-update, signal).
    #[serde(default)]
    pub setting: u8,
    /// Globally unique message id.
    pub message_id: i64,
    /// Position of the message inside its channel.
    pub message_seq: u64,
    /// Client-generated idempotency number.
    #[serde(default)]
    pub client_msg_no: String,
    /// Sender uid.
    pub from_uid: String,
    /// Recipient uid for person channels.
    #[serde(default)]
    pub to_uid: String,
    /// Channel id as delivered.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Server timestamp in seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Raw message content (JSON document for every content type we read).
    #[serde(default, with = "base64_payload")]
    pub payload: Vec<u8>,
}

impl EngineMessage {
    /// Message id in its string form, used as the storage key everywhere.
    pub fn message_id_str(&self) -> String {
        self.message_id.to_string()
    }

    /// Channel the message was delivered on.
    pub fn channel(&self) -> ChannelKey {
        ChannelKey::new(self.channel_id.clone(), self.channel_type)
    }

    /// Decode the payload as JSON, `None` when it is empty or not JSON.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        if self.payload.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Direction of a channel history pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PullMode {
    /// Older messages (towards lower seqs).
    #[default]
    Down,
    /// Newer messages (towards higher seqs).
    Up,
}

impl TryFrom<u8> for PullMode {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Down),
            1 => Ok(Self::Up),
            other => Err(SyncError::InvalidPullMode(other)),
        }
    }
}

impl From<PullMode> for u8 {
    fn from(value: PullMode) -> Self {
        match value {
            PullMode::Down => 0,
            PullMode::Up => 1,
        }
    }
}

/// A conversation as reported by the engine for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    /// Channel id from the user's perspective (peer uid for person chats).
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// Unread count.
    #[serde(default)]
    pub unread: i64,
    /// Time of the last message in seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Seq of the newest message.
    #[serde(default)]
    pub last_msg_seq: u64,
    /// Client number of the newest message.
    #[serde(default)]
    pub last_client_msg_no: String,
    /// Seq below which the engine already hides history.
    #[serde(default)]
    pub offset_msg_seq: u64,
    /// Conversation version.
    #[serde(default)]
    pub version: Version,
    /// Most recent messages, newest first.
    #[serde(default)]
    pub recents: Vec<EngineMessage>,
}

impl ConversationSnapshot {
    /// Channel this conversation belongs to.
    pub fn channel(&self) -> ChannelKey {
        ChannelKey::new(self.channel_id.clone(), self.channel_type)
    }
}

/// Request for a user's conversations changed since a baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConversationsRequest {
    /// User whose conversations are fetched.
    pub uid: String,
    /// Conversation version baseline.
    pub version: Version,
    /// Per-channel last seen seqs, encoded `channel:type:seq|...`.
    pub last_msg_seqs: String,
    /// Maximum recent messages per conversation.
    pub msg_count: u32,
    /// Broadcast ("large") channels the user belongs to.
    pub larges: Vec<ChannelKey>,
}

/// Request for a window of channel history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessagesRequest {
    /// Requesting user.
    pub login_uid: String,
    /// Requesting device.
    #[serde(default)]
    pub device_uuid: String,
    /// Channel id.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// First seq of the window.
    pub start_message_seq: u64,
    /// Last seq of the window (0 = unbounded).
    pub end_message_seq: u64,
    /// Maximum messages returned.
    pub limit: u32,
    /// Pull direction.
    pub pull_mode: PullMode,
}

/// A page of channel history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessagesPage {
    /// First seq covered.
    pub start_message_seq: u64,
    /// Last seq covered.
    pub end_message_seq: u64,
    /// Pull direction.
    #[serde(default)]
    pub pull_mode: PullMode,
    /// Messages in the window.
    #[serde(default)]
    pub messages: Vec<EngineMessage>,
}

/// Request to reset a conversation's unread counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearUnreadRequest {
    /// Owner of the conversation.
    pub uid: String,
    /// Channel id.
    pub channel_id: String,
    /// Channel kind.
    pub channel_type: ChannelType,
    /// New unread count.
    pub unread: i64,
    /// Seq the user has read up to.
    pub message_seq: u64,
}

mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
