//! Reminder derivation, sync and completion.

use crate::config::SyncConfig;
use crate::error::Result;
use crate::storage::{ReminderStore, SqliteStorage};
use std::sync::Arc;
use sync_types::api::{ReminderSyncRequest, ReminderView};
use sync_types::EngineMessage;

/// Turns delivered messages into reminders and serves them to users.
pub struct ReminderEngine {
    storage: Arc<SqliteStorage>,
    config: SyncConfig,
}

impl ReminderEngine {
    /// Create an engine over `storage`.
    pub fn new(storage: Arc<SqliteStorage>, config: SyncConfig) -> Self {
        Self { storage, config }
    }

    /// Derive reminders for newly delivered messages and persist them in one
    /// transaction. Returns how many were created.
    pub async fn ingest(&self, messages: &[EngineMessage]) -> Result<u64> {
        let drafts = sync_core::derive(messages);
        if drafts.is_empty() {
            return Ok(0);
        }
        let created = self.storage.insert_reminders(&drafts).await?;
        tracing::debug!(
            messages = messages.len(),
            derived = drafts.len(),
            created,
            "Reminders ingested"
        );
        Ok(created)
    }

    /// Reminders visible to `uid` after the requested version.
    pub async fn sync(&self, uid: &str, req: &ReminderSyncRequest) -> Result<Vec<ReminderView>> {
        let limit = SyncConfig::clamp_limit(
            req.limit,
            self.config.reminder_default_limit,
            self.config.reminder_max_limit,
        );
        let records = self
            .storage
            .sync_reminders(uid, req.version, &req.channel_ids, limit)
            .await?;
        Ok(records.iter().map(|r| r.to_view()).collect())
    }

    /// Mark reminders done for `uid`.
    pub async fn mark_done(&self, uid: &str, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.storage.mark_done(ids, uid).await?)
    }
}
