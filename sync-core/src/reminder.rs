//! Reminder derivation from delivered messages.
//!
//! A message payload can carry a mention block
//! (`{"mention": {"all": 1, "uids": [...]}}`) or be a group-join request
//! (`{"type": 1009, "visibles": [...]}`). Each produces reminder drafts.
//! Drafts carry no version: the caller assigns a fresh one to every draft
//! when it persists the batch.

use convsync_types::{ChannelKey, EngineMessage, ReminderType};
use serde_json::Value;

/// Content type of a group member invite / join request message.
pub const GROUP_MEMBER_INVITE: i64 = 1009;

/// A reminder derived from a message, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReminderDraft {
    /// Channel the message was delivered on.
    pub channel: ChannelKey,
    /// Client number of the originating message.
    pub client_msg_no: String,
    /// Id of the originating message.
    pub message_id: String,
    /// Seq of the originating message.
    pub message_seq: u64,
    /// Kind of reminder.
    pub reminder_type: ReminderType,
    /// Uid that caused the reminder.
    pub publisher: String,
    /// Target uid; empty means every member of the channel.
    pub uid: String,
    /// Display text.
    pub text: String,
    /// Extra data.
    pub data: Option<Value>,
    /// Whether the client should jump to the message.
    pub is_locate: bool,
}

impl ReminderDraft {
    /// Whether this reminder targets the whole channel.
    pub fn is_broadcast(&self) -> bool {
        self.uid.is_empty()
    }
}

/// Derive reminders for a batch of newly delivered messages.
///
/// Messages whose payload is not JSON are skipped.
pub fn derive(messages: &[EngineMessage]) -> Vec<ReminderDraft> {
    let mut drafts = Vec::new();
    for message in messages {
        let Some(payload) = message.payload_json() else {
            continue;
        };
        mention_reminders(message, &payload, &mut drafts);
        join_request_reminders(message, &payload, &mut drafts);
    }
    drafts
}

fn mention_reminders(message: &EngineMessage, payload: &Value, out: &mut Vec<ReminderDraft>) {
    let Some(mention) = payload.get("mention").filter(|m| m.is_object()) else {
        return;
    };

    if mention.get("all").map(is_truthy).unwrap_or(false) {
        out.push(draft(message, ReminderType::MentionMe, String::new()));
        return;
    }

    for uid in string_list(mention.get("uids")) {
        out.push(draft(message, ReminderType::MentionMe, uid));
    }
}

fn join_request_reminders(message: &EngineMessage, payload: &Value, out: &mut Vec<ReminderDraft>) {
    if payload.get("type").and_then(Value::as_i64) != Some(GROUP_MEMBER_INVITE) {
        return;
    }
    for uid in string_list(payload.get("visibles")) {
        out.push(draft(message, ReminderType::ApplyJoinGroup, uid));
    }
}

fn draft(message: &EngineMessage, reminder_type: ReminderType, uid: String) -> ReminderDraft {
    ReminderDraft {
        channel: message.channel(),
        client_msg_no: message.client_msg_no.clone(),
        message_id: message.message_id_str(),
        message_seq: message.message_seq,
        reminder_type,
        publisher: message.from_uid.clone(),
        uid,
        text: reminder_type.text().to_string(),
        data: None,
        is_locate: true,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

/// Distinct, non-empty strings of a JSON array, in order of first appearance.
fn string_list(value: Option<&Value>) -> Vec<String> {
    let mut seen = Vec::new();
    let Some(items) = value.and_then(Value::as_array) else {
        return seen;
    };
    for item in items.iter().filter_map(Value::as_str) {
        if !item.is_empty() && !seen.iter().any(|s: &String| s == item) {
            seen.push(item.to_string());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use convsync_types::ChannelType;

    fn message(seq: u64, payload: &str) -> EngineMessage {
        EngineMessage {
            header: Default::default(),
            setting: 0,
            message_id: 1000 + seq as i64,
            message_seq: seq,
            client_msg_no: format!("cmn-{seq}"),
            from_uid: "sender".into(),
            to_uid: String::new(),
            channel_id: "g1".into(),
            channel_type: ChannelType::Group,
            timestamp: 0,
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn mention_all_produces_one_broadcast() {
        let drafts = derive(&[message(1, r#"{"mention":{"all":1,"uids":["a","b"]}}"#)]);
        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].is_broadcast());
        assert_eq!(drafts[0].reminder_type, ReminderType::MentionMe);
        assert_eq!(drafts[0].publisher, "sender");
        assert_eq!(drafts[0].message_id, "1001");
        assert!(drafts[0].is_locate);
    }

    #[test]
    fn explicit_mentions_produce_one_per_uid() {
        let drafts = derive(&[message(2, r#"{"mention":{"uids":["a","b","a"]}}"#)]);
        let uids: Vec<&str> = drafts.iter().map(|d| d.uid.as_str()).collect();
        assert_eq!(uids, vec!["a", "b"]);
        assert!(drafts.iter().all(|d| d.text == "[mentioned you]"));
    }

    #[test]
    fn mention_all_false_falls_back_to_uids() {
        let drafts = derive(&[message(3, r#"{"mention":{"all":0,"uids":["a"]}}"#)]);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].uid, "a");
    }

    #[test]
    fn join_request_targets_visible_uids() {
        let drafts = derive(&[message(
            4,
            r#"{"type":1009,"visibles":["owner","admin"]}"#,
        )]);
        assert_eq!(drafts.len(), 2);
        assert!(drafts
            .iter()
            .all(|d| d.reminder_type == ReminderType::ApplyJoinGroup));
        assert_eq!(drafts[1].uid, "admin");
    }

    #[test]
    fn visibles_ignored_for_other_content_types() {
        assert!(derive(&[message(5, r#"{"type":1,"visibles":["owner"]}"#)]).is_empty());
    }

    #[test]
    fn plain_and_undecodable_messages_produce_nothing() {
        let drafts = derive(&[
            message(6, r#"{"type":1,"content":"hello"}"#),
            message(7, "binary-garbage"),
            message(8, ""),
        ]);
        assert!(drafts.is_empty());
    }

    #[test]
    fn batch_preserves_message_order() {
        let drafts = derive(&[
            message(9, r#"{"mention":{"uids":["x"]}}"#),
            message(10, r#"{"mention":{"all":true}}"#),
        ]);
        let seqs: Vec<u64> = drafts.iter().map(|d| d.message_seq).collect();
        assert_eq!(seqs, vec![9, 10]);
    }
}
