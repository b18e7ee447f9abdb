//! The external IM engine collaborator.
//!
//! The engine owns message persistence, fan-out and group membership. This
//! service only reads from it (conversations, channel history, membership)
//! and asks it to clear unread counters.

mod http;
mod mock;

pub use http::HttpImEngine;
pub use mock::MockImEngine;

#[cfg(test)]
pub(crate) use mock::tests::{conversation as mock_conversation, message as mock_message};

use crate::error::EngineResult;
use async_trait::async_trait;
use std::collections::HashSet;
use sync_types::engine::{
    ChannelMessagesPage, ChannelMessagesRequest, ClearUnreadRequest, ConversationSnapshot,
    FetchConversationsRequest,
};
use sync_types::ChannelKey;

/// Operations consumed from the IM engine.
#[async_trait]
pub trait ImEngine: Send + Sync {
    /// Conversations of a user changed at or after the request's version.
    async fn fetch_user_conversations(
        &self,
        req: &FetchConversationsRequest,
    ) -> EngineResult<Vec<ConversationSnapshot>>;

    /// A page of one channel's history.
    async fn fetch_channel_messages(
        &self,
        req: &ChannelMessagesRequest,
    ) -> EngineResult<ChannelMessagesPage>;

    /// Whether `uid` is currently a member of `channel`.
    async fn is_channel_member(&self, channel: &ChannelKey, uid: &str) -> EngineResult<bool>;

    /// The groups among `group_ids` that `uid` is currently a member of.
    async fn member_groups(&self, group_ids: &[String], uid: &str)
        -> EngineResult<HashSet<String>>;

    /// Large broadcast channels `uid` belongs to.
    async fn broadcast_channels(&self, uid: &str) -> EngineResult<Vec<ChannelKey>>;

    /// Reset a conversation's unread counter.
    async fn clear_unread(&self, req: &ClearUnreadRequest) -> EngineResult<()>;
}
