//! Message mutations issued by users.
//!
//! Every action validates its request before touching storage. Channel-global
//! facts (extras, reactions) of person chats are written under the fake
//! channel id both participants share; per-user facts (offsets) stay keyed by
//! the channel as the user addresses it.

use crate::engine::ImEngine;
use crate::error::Result;
use crate::storage::{
    EditOutcome, ExtraStore, OffsetStore, ReactionStore, ReminderStore, SqliteStorage,
};
use std::sync::Arc;
use sync_types::api::{
    EditRequest, MemberOffsetRequest, MessageRef, OffsetRequest, ReactionRequest,
    ReactionToggleResponse, ReadedRequest, RevokeRequest,
};
use sync_types::engine::ClearUnreadRequest;
use sync_types::{ChannelKey, Version};

/// `message` with its channel replaced by the key shared stores use.
fn stored_ref(uid: &str, message: &MessageRef) -> MessageRef {
    let channel = message.channel().storage_key(uid);
    MessageRef {
        message_id: message.message_id.clone(),
        message_seq: message.message_seq,
        channel_id: channel.channel_id,
        channel_type: channel.channel_type,
    }
}

/// Executes message mutations against storage and the IM engine.
pub struct MessageActions {
    storage: Arc<SqliteStorage>,
    engine: Arc<dyn ImEngine>,
}

impl MessageActions {
    /// Create the action set.
    pub fn new(storage: Arc<SqliteStorage>, engine: Arc<dyn ImEngine>) -> Self {
        Self { storage, engine }
    }

    /// Revoke a message, unpin it and retract its reminders.
    pub async fn revoke(&self, uid: &str, req: &RevokeRequest) -> Result<Version> {
        req.message.validate()?;
        let version = self
            .storage
            .revoke_message(uid, &stored_ref(uid, &req.message))
            .await?;
        tracing::info!(
            uid,
            message_id = %req.message.message_id,
            client_msg_no = %req.client_msg_no,
            %version,
            "Message revoked"
        );
        Ok(version)
    }

    /// Store edited content. Retried identical edits are accepted unchanged.
    pub async fn edit(&self, uid: &str, req: &EditRequest) -> Result<EditOutcome> {
        req.validate()?;
        let outcome = self
            .storage
            .set_edit(&stored_ref(uid, &req.message), &req.content_edit)
            .await?;
        if outcome == EditOutcome::Unchanged {
            tracing::warn!(uid, message_id = %req.message.message_id, "Identical edit ignored");
        }
        Ok(outcome)
    }

    /// Flip the pin flag of a message.
    pub async fn toggle_pinned(&self, uid: &str, message: &MessageRef) -> Result<(bool, Version)> {
        message.validate()?;
        let (pinned, version) = self
            .storage
            .toggle_pinned(&stored_ref(uid, message))
            .await?;
        tracing::debug!(uid, message_id = %message.message_id, pinned, "Pin toggled");
        Ok((pinned, version))
    }

    /// Delete a message for every member.
    pub async fn mutual_delete(&self, uid: &str, message: &MessageRef) -> Result<Version> {
        message.validate()?;
        Ok(self
            .storage
            .mark_mutual_deleted(&stored_ref(uid, message))
            .await?)
    }

    /// Delete messages for `uid` only.
    pub async fn delete_for_user(&self, uid: &str, messages: &[MessageRef]) -> Result<()> {
        for message in messages {
            message.validate()?;
        }
        if messages.is_empty() {
            return Ok(());
        }
        self.storage.mark_user_deleted(uid, messages).await?;
        Ok(())
    }

    /// Record read receipts. Returns how many messages were read for the
    /// first time.
    pub async fn mark_read(&self, uid: &str, req: &ReadedRequest) -> Result<u64> {
        req.validate()?;
        let channel = ChannelKey::new(req.channel_id.clone(), req.channel_type).storage_key(uid);
        Ok(self.storage.mark_read(uid, &channel, &req.messages).await?)
    }

    /// Record that `uid` played a voice message.
    pub async fn mark_voice_read(&self, uid: &str, message: &MessageRef) -> Result<()> {
        message.validate()?;
        self.storage.mark_voice_read(uid, message).await?;
        Ok(())
    }

    /// Toggle a reaction.
    pub async fn toggle_reaction(
        &self,
        uid: &str,
        req: &ReactionRequest,
    ) -> Result<ReactionToggleResponse> {
        req.validate()?;
        let channel = ChannelKey::new(req.channel_id.clone(), req.channel_type).storage_key(uid);
        let name = if req.name.is_empty() {
            uid
        } else {
            req.name.as_str()
        };
        let toggled = self
            .storage
            .toggle_reaction(uid, name, &channel, &req.message_id, &req.emoji)
            .await?;
        tracing::debug!(
            uid,
            message_id = %req.message_id,
            change = ?toggled.change,
            seq = toggled.record.seq,
            "Reaction toggled"
        );
        Ok(ReactionToggleResponse {
            is_deleted: u8::from(toggled.record.is_deleted),
            emoji: toggled.record.emoji,
            seq: toggled.record.seq,
        })
    }

    /// Clear a channel's history up to `message_seq` for `uid`.
    ///
    /// Returns `false` when the stored offset was already there. The engine's
    /// unread reset is best effort.
    pub async fn clear_channel(&self, uid: &str, req: &OffsetRequest) -> Result<bool> {
        req.validate()?;
        let channel = ChannelKey::new(req.channel_id.clone(), req.channel_type);
        if !self
            .storage
            .clear_channel(uid, &channel, req.message_seq)
            .await?
        {
            tracing::debug!(uid, %channel, seq = req.message_seq, "Offset already ahead");
            return Ok(false);
        }

        let clear = ClearUnreadRequest {
            uid: uid.to_string(),
            channel_id: channel.channel_id.clone(),
            channel_type: channel.channel_type,
            unread: 0,
            message_seq: req.message_seq,
        };
        if let Err(e) = self.engine.clear_unread(&clear).await {
            tracing::warn!(uid, %channel, error = %e, "Failed to clear conversation unread");
        }
        Ok(true)
    }

    /// Reset offsets of members who (re)joined a group.
    ///
    /// Members see history from the start when it is visible, otherwise only
    /// messages after `channel_max_seq`.
    pub async fn reset_member_offsets(&self, req: &MemberOffsetRequest) -> Result<usize> {
        req.validate()?;
        let channel = ChannelKey::new(req.channel_id.clone(), req.channel_type);
        let seq = if req.history_visible {
            0
        } else {
            req.channel_max_seq
        };
        for uid in &req.uids {
            self.storage.reset_channel_offset(uid, &channel, seq).await?;
        }
        tracing::info!(%channel, members = req.uids.len(), seq, "Member offsets reset");
        Ok(req.uids.len())
    }

    /// Retract reminders of members removed from a group.
    pub async fn remove_members(&self, req: &MemberOffsetRequest) -> Result<u64> {
        req.validate()?;
        let channel = ChannelKey::new(req.channel_id.clone(), req.channel_type);
        let mut retracted = 0;
        for uid in &req.uids {
            retracted += self.storage.cancel_for_channel_user(uid, &channel).await?;
        }
        tracing::info!(%channel, members = req.uids.len(), retracted, "Member reminders retracted");
        Ok(retracted)
    }
}
