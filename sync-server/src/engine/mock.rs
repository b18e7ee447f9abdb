//! Scripted in-process engine for tests and local runs.

use super::ImEngine;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use sync_types::engine::{
    ChannelMessagesPage, ChannelMessagesRequest, ClearUnreadRequest, ConversationSnapshot,
    FetchConversationsRequest,
};
use sync_types::{ChannelKey, EngineMessage, PullMode};
use tokio::sync::Mutex;

#[derive(Default)]
struct MockState {
    conversations: HashMap<String, Vec<ConversationSnapshot>>,
    history: HashMap<ChannelKey, Vec<EngineMessage>>,
    non_members: HashSet<(ChannelKey, String)>,
    broadcast: HashMap<String, Vec<ChannelKey>>,
    failure: Option<String>,
    fetches: Vec<FetchConversationsRequest>,
    membership_checks: usize,
    cleared: Vec<ClearUnreadRequest>,
}

/// An [`ImEngine`] backed by in-memory scripts.
///
/// Every user is a member of every channel unless removed with
/// [`MockImEngine::remove_member`].
#[derive(Default)]
pub struct MockImEngine {
    state: Mutex<MockState>,
}

impl MockImEngine {
    /// Create an engine with no scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the conversations reported for `uid`.
    pub async fn set_conversations(&self, uid: &str, conversations: Vec<ConversationSnapshot>) {
        self.state
            .lock()
            .await
            .conversations
            .insert(uid.to_string(), conversations);
    }

    /// Append messages to a channel's history.
    pub async fn push_history(&self, channel: ChannelKey, messages: Vec<EngineMessage>) {
        let mut state = self.state.lock().await;
        let history = state.history.entry(channel).or_default();
        history.extend(messages);
        history.sort_by_key(|m| m.message_seq);
    }

    /// Make `uid` a non-member of `channel`.
    pub async fn remove_member(&self, channel: ChannelKey, uid: &str) {
        self.state
            .lock()
            .await
            .non_members
            .insert((channel, uid.to_string()));
    }

    /// Replace the broadcast channels reported for `uid`.
    pub async fn set_broadcast_channels(&self, uid: &str, channels: Vec<ChannelKey>) {
        self.state
            .lock()
            .await
            .broadcast
            .insert(uid.to_string(), channels);
    }

    /// Make every call fail with [`EngineError::Unavailable`] until cleared.
    pub async fn fail_with(&self, reason: Option<&str>) {
        self.state.lock().await.failure = reason.map(str::to_string);
    }

    /// Conversation fetches seen so far.
    pub async fn fetches(&self) -> Vec<FetchConversationsRequest> {
        self.state.lock().await.fetches.clone()
    }

    /// Membership calls seen so far.
    pub async fn membership_checks(&self) -> usize {
        self.state.lock().await.membership_checks
    }

    /// Unread resets seen so far.
    pub async fn cleared(&self) -> Vec<ClearUnreadRequest> {
        self.state.lock().await.cleared.clone()
    }

    fn check(state: &MockState) -> EngineResult<()> {
        match &state.failure {
            Some(reason) => Err(EngineError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ImEngine for MockImEngine {
    async fn fetch_user_conversations(
        &self,
        req: &FetchConversationsRequest,
    ) -> EngineResult<Vec<ConversationSnapshot>> {
        let mut state = self.state.lock().await;
        Self::check(&state)?;
        state.fetches.push(req.clone());
        let conversations = state
            .conversations
            .get(&req.uid)
            .map(|all| {
                all.iter()
                    .filter(|c| req.version.is_zero() || c.version > req.version)
                    .cloned()
                    .map(|mut c| {
                        if req.msg_count > 0 {
                            c.recents.truncate(req.msg_count as usize);
                        }
                        c
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(conversations)
    }

    async fn fetch_channel_messages(
        &self,
        req: &ChannelMessagesRequest,
    ) -> EngineResult<ChannelMessagesPage> {
        let state = self.state.lock().await;
        Self::check(&state)?;
        let channel = ChannelKey::new(req.channel_id.clone(), req.channel_type);
        let in_window = |m: &&EngineMessage| {
            let seq = m.message_seq;
            match req.pull_mode {
                PullMode::Up => {
                    seq > req.start_message_seq
                        && (req.end_message_seq == 0 || seq <= req.end_message_seq)
                }
                PullMode::Down => {
                    (req.start_message_seq == 0 || seq <= req.start_message_seq)
                        && seq > req.end_message_seq
                }
            }
        };
        let limit = req.limit.max(1) as usize;
        let history = state.history.get(&channel).map(Vec::as_slice).unwrap_or(&[]);
        let messages: Vec<EngineMessage> = match req.pull_mode {
            PullMode::Up => history.iter().filter(in_window).take(limit).cloned().collect(),
            PullMode::Down => {
                let mut newest: Vec<EngineMessage> = history
                    .iter()
                    .rev()
                    .filter(in_window)
                    .take(limit)
                    .cloned()
                    .collect();
                newest.reverse();
                newest
            }
        };
        Ok(ChannelMessagesPage {
            start_message_seq: req.start_message_seq,
            end_message_seq: req.end_message_seq,
            pull_mode: req.pull_mode,
            messages,
        })
    }

    async fn is_channel_member(&self, channel: &ChannelKey, uid: &str) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        Self::check(&state)?;
        state.membership_checks += 1;
        Ok(!state
            .non_members
            .contains(&(channel.clone(), uid.to_string())))
    }

    async fn member_groups(
        &self,
        group_ids: &[String],
        uid: &str,
    ) -> EngineResult<HashSet<String>> {
        let mut state = self.state.lock().await;
        Self::check(&state)?;
        state.membership_checks += 1;
        Ok(group_ids
            .iter()
            .filter(|id| {
                !state
                    .non_members
                    .contains(&(ChannelKey::group(id.as_str()), uid.to_string()))
            })
            .cloned()
            .collect())
    }

    async fn broadcast_channels(&self, uid: &str) -> EngineResult<Vec<ChannelKey>> {
        let state = self.state.lock().await;
        Self::check(&state)?;
        Ok(state.broadcast.get(uid).cloned().unwrap_or_default())
    }

    async fn clear_unread(&self, req: &ClearUnreadRequest) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        Self::check(&state)?;
        state.cleared.push(req.clone());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sync_types::engine::MessageHeader;
    use sync_types::{ChannelType, Version};

    pub(crate) fn message(channel: &ChannelKey, seq: u64, from: &str, payload: &str) -> EngineMessage {
        EngineMessage {
            header: MessageHeader::default(),
            setting: 0,
            message_id: 1000 + seq as i64,
            message_seq: seq,
            client_msg_no: format!("c{seq}"),
            from_uid: from.to_string(),
            to_uid: String::new(),
            channel_id: channel.channel_id.clone(),
            channel_type: channel.channel_type,
            timestamp: 1_700_000_000 + seq as i64,
            payload: payload.as_bytes().to_vec(),
        }
    }

    pub(crate) fn conversation(
        channel: &ChannelKey,
        version: u64,
        recents: Vec<EngineMessage>,
    ) -> ConversationSnapshot {
        ConversationSnapshot {
            channel_id: channel.channel_id.clone(),
            channel_type: channel.channel_type,
            unread: recents.len() as i64,
            timestamp: 0,
            last_msg_seq: recents.iter().map(|m| m.message_seq).max().unwrap_or(0),
            last_client_msg_no: String::new(),
            offset_msg_seq: 0,
            version: Version::new(version),
            recents,
        }
    }

    fn pull(channel: &ChannelKey, start: u64, end: u64, limit: u32, mode: PullMode) -> ChannelMessagesRequest {
        ChannelMessagesRequest {
            login_uid: "alice".into(),
            device_uuid: "d1".into(),
            channel_id: channel.channel_id.clone(),
            channel_type: channel.channel_type,
            start_message_seq: start,
            end_message_seq: end,
            limit,
            pull_mode: mode,
        }
    }

    #[tokio::test]
    async fn filters_conversations_by_version() {
        let engine = MockImEngine::new();
        let g1 = ChannelKey::group("g1");
        let g2 = ChannelKey::group("g2");
        engine
            .set_conversations("alice", vec![conversation(&g1, 3, vec![]), conversation(&g2, 8, vec![])])
            .await;
        let req = FetchConversationsRequest {
            uid: "alice".into(),
            version: Version::new(5),
            last_msg_seqs: String::new(),
            msg_count: 20,
            larges: vec![],
        };
        let found = engine.fetch_user_conversations(&req).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].channel(), g2);
        assert_eq!(engine.fetches().await.len(), 1);
    }

    #[tokio::test]
    async fn pulls_windows_in_both_directions() {
        let engine = MockImEngine::new();
        let g1 = ChannelKey::group("g1");
        engine
            .push_history(g1.clone(), (1..=10).map(|s| message(&g1, s, "bob", "{}")).collect())
            .await;

        let up = engine
            .fetch_channel_messages(&pull(&g1, 3, 0, 2, PullMode::Up))
            .await
            .unwrap();
        let seqs: Vec<_> = up.messages.iter().map(|m| m.message_seq).collect();
        assert_eq!(seqs, vec![4, 5]);

        let down = engine
            .fetch_channel_messages(&pull(&g1, 0, 0, 3, PullMode::Down))
            .await
            .unwrap();
        let seqs: Vec<_> = down.messages.iter().map(|m| m.message_seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn failure_injection_and_membership() {
        let engine = MockImEngine::new();
        let g1 = ChannelKey::new("g1", ChannelType::Group);
        assert!(engine.is_channel_member(&g1, "alice").await.unwrap());
        engine.remove_member(g1.clone(), "alice").await;
        assert!(!engine.is_channel_member(&g1, "alice").await.unwrap());
        let groups = engine
            .member_groups(&["g1".to_string(), "g2".to_string()], "alice")
            .await
            .unwrap();
        assert_eq!(groups, HashSet::from(["g2".to_string()]));
        assert_eq!(engine.membership_checks().await, 3);

        engine.fail_with(Some("down")).await;
        assert!(matches!(
            engine.broadcast_channels("alice").await,
            Err(EngineError::Unavailable(_))
        ));
        engine.fail_with(None).await;
        assert!(engine.broadcast_channels("alice").await.unwrap().is_empty());
    }
}
