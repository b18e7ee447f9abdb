//! Per-(user, channel) conversation UI state.

use super::sqlite::{channel_from_row, next_version_in, SqliteStorage};
use super::{
    ConversationExtraRecord, ConversationExtraStore, ConversationExtraUpdate,
    CONVERSATION_EXTRA_SEQUENCE_KEY,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use sync_types::{ChannelKey, Version};

const COLUMNS: &str =
    "uid, channel_id, channel_type, browse_to, keep_message_seq, keep_offset_y, draft, version";

#[derive(sqlx::FromRow)]
struct ConversationExtraRow {
    uid: String,
    channel_id: String,
    channel_type: i64,
    browse_to: i64,
    keep_message_seq: i64,
    keep_offset_y: i64,
    draft: String,
    version: i64,
}

impl TryFrom<ConversationExtraRow> for ConversationExtraRecord {
    type Error = StorageError;

    fn try_from(row: ConversationExtraRow) -> Result<Self, Self::Error> {
        Ok(ConversationExtraRecord {
            uid: row.uid,
            channel: channel_from_row("conversation_extra", row.channel_id, row.channel_type)?,
            browse_to: row.browse_to.max(0) as u64,
            keep_message_seq: row.keep_message_seq.max(0) as u64,
            keep_offset_y: row.keep_offset_y,
            draft: row.draft,
            version: Version::from_i64(row.version),
        })
    }
}

#[async_trait]
impl ConversationExtraStore for SqliteStorage {
    async fn upsert_conversation_extra(
        &self,
        uid: &str,
        channel: &ChannelKey,
        update: &ConversationExtraUpdate,
    ) -> StorageResult<ConversationExtraRecord> {
        let mut tx = self.begin_write().await?;
        let version = next_version_in(&mut tx, CONVERSATION_EXTRA_SEQUENCE_KEY).await?;
        let row = sqlx::query_as::<_, ConversationExtraRow>(&format!(
            r#"
            INSERT INTO conversation_extra (uid, channel_id, channel_type, browse_to,
                keep_message_seq, keep_offset_y, draft, version, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(uid, channel_id, channel_type) DO UPDATE SET
                browse_to = MAX(browse_to, excluded.browse_to),
                keep_message_seq = excluded.keep_message_seq,
                keep_offset_y = excluded.keep_offset_y,
                draft = excluded.draft,
                version = excluded.version,
                updated_at = excluded.updated_at
            RETURNING {COLUMNS}
            "#
        ))
        .bind(uid)
        .bind(&channel.channel_id)
        .bind(i64::from(channel.channel_type.as_u8()))
        .bind(update.browse_to as i64)
        .bind(update.keep_message_seq as i64)
        .bind(update.keep_offset_y)
        .bind(&update.draft)
        .bind(version.as_i64())
        .bind(Self::current_timestamp())
        .fetch_one(&mut *tx)
        .await
        .map_err(StorageError::Database)?;
        tx.commit().await.map_err(StorageError::Database)?;
        ConversationExtraRecord::try_from(row)
    }

    async fn sync_conversation_extras(
        &self,
        uid: &str,
        version: Version,
    ) -> StorageResult<Vec<ConversationExtraRecord>> {
        let rows = sqlx::query_as::<_, ConversationExtraRow>(&format!(
            "SELECT {COLUMNS} FROM conversation_extra WHERE uid = ?1 AND version > ?2 ORDER BY version ASC"
        ))
        .bind(uid)
        .bind(version.as_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        rows.into_iter()
            .map(ConversationExtraRecord::try_from)
            .collect()
    }

    async fn conversation_extras_for(
        &self,
        uid: &str,
        channels: &[ChannelKey],
    ) -> StorageResult<HashMap<ChannelKey, ConversationExtraRecord>> {
        if channels.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {COLUMNS} FROM conversation_extra WHERE uid = "
        ));
        builder.push_bind(uid.to_string());
        builder.push(" AND channel_id IN (");
        let mut ids = builder.separated(", ");
        for channel in channels {
            ids.push_bind(channel.channel_id.clone());
        }
        ids.push_unseparated(")");

        let rows = builder
            .build_query_as::<ConversationExtraRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        let mut extras = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = ConversationExtraRecord::try_from(row)?;
            if channels.contains(&record.channel) {
                extras.insert(record.channel.clone(), record);
            }
        }
        Ok(extras)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(browse_to: u64, draft: &str) -> ConversationExtraUpdate {
        ConversationExtraUpdate {
            browse_to,
            keep_message_seq: browse_to,
            keep_offset_y: 12,
            draft: draft.to_string(),
        }
    }

    #[tokio::test]
    async fn browse_to_merges_with_max_and_draft_overwrites() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let channel = ChannelKey::group("g1");
        let first = storage
            .upsert_conversation_extra("alice", &channel, &update(30, "hello"))
            .await
            .unwrap();
        let second = storage
            .upsert_conversation_extra("alice", &channel, &update(10, ""))
            .await
            .unwrap();

        assert_eq!(second.browse_to, 30);
        assert_eq!(second.keep_message_seq, 10);
        assert_eq!(second.draft, "");
        assert!(second.version > first.version);
    }

    #[tokio::test]
    async fn sync_returns_only_newer_rows_of_the_user() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let a = storage
            .upsert_conversation_extra("alice", &ChannelKey::group("g1"), &update(1, ""))
            .await
            .unwrap();
        storage
            .upsert_conversation_extra("alice", &ChannelKey::person("bob"), &update(2, "hi"))
            .await
            .unwrap();
        storage
            .upsert_conversation_extra("carol", &ChannelKey::group("g1"), &update(3, ""))
            .await
            .unwrap();

        let all = storage
            .sync_conversation_extras("alice", Version::zero())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let newer = storage
            .sync_conversation_extras("alice", a.version)
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].channel, ChannelKey::person("bob"));
    }

    #[tokio::test]
    async fn extras_for_channels_matches_type() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .upsert_conversation_extra("alice", &ChannelKey::person("x"), &update(1, "d"))
            .await
            .unwrap();
        let found = storage
            .conversation_extras_for("alice", &[ChannelKey::group("x")])
            .await
            .unwrap();
        assert!(found.is_empty());
        let found = storage
            .conversation_extras_for("alice", &[ChannelKey::person("x")])
            .await
            .unwrap();
        assert_eq!(found[&ChannelKey::person("x")].draft, "d");
    }
}
