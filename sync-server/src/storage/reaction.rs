//! Reactions: one row per (message, user), soft-deleted on retraction.

use super::sqlite::{channel_from_row, next_version_in, SqliteStorage};
use super::{reaction_sequence_key, ReactionRecord, ReactionStore, ReactionToggled};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use sync_core::{toggle, ExistingReaction};
use sync_types::ChannelKey;

const REACTION_COLUMNS: &str =
    "message_id, uid, name, channel_id, channel_type, emoji, seq, is_deleted";

#[derive(sqlx::FromRow)]
struct ReactionRow {
    message_id: String,
    uid: String,
    name: String,
    channel_id: String,
    channel_type: i64,
    emoji: String,
    seq: i64,
    is_deleted: i64,
}

impl TryFrom<ReactionRow> for ReactionRecord {
    type Error = StorageError;

    fn try_from(row: ReactionRow) -> Result<Self, Self::Error> {
        Ok(ReactionRecord {
            message_id: row.message_id,
            uid: row.uid,
            name: row.name,
            channel: channel_from_row("reactions", row.channel_id, row.channel_type)?,
            emoji: row.emoji,
            seq: row.seq.max(0) as u64,
            is_deleted: row.is_deleted != 0,
        })
    }
}

#[async_trait]
impl ReactionStore for SqliteStorage {
    async fn toggle_reaction(
        &self,
        uid: &str,
        name: &str,
        channel: &ChannelKey,
        message_id: &str,
        emoji: &str,
    ) -> StorageResult<ReactionToggled> {
        let mut tx = self.begin_write().await?;
        let existing = sqlx::query_as::<_, ReactionRow>(&format!(
            "SELECT {REACTION_COLUMNS} FROM reactions WHERE message_id = ?1 AND uid = ?2"
        ))
        .bind(message_id)
        .bind(uid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::Database)?;

        let change = toggle(
            existing.as_ref().map(|row| ExistingReaction {
                emoji: row.emoji.as_str(),
                is_deleted: row.is_deleted != 0,
            }),
            emoji,
        );
        // A retraction keeps the emoji that was retracted.
        let stored_emoji = match (&existing, change.leaves_deleted()) {
            (Some(row), true) => row.emoji.clone(),
            _ => emoji.to_string(),
        };

        let seq = next_version_in(&mut tx, &reaction_sequence_key(channel)).await?;
        let now = Self::current_timestamp();
        sqlx::query(
            r#"
            INSERT INTO reactions (message_id, uid, name, channel_id, channel_type, emoji, seq,
                is_deleted, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(message_id, uid) DO UPDATE SET
                name = excluded.name,
                emoji = excluded.emoji,
                seq = excluded.seq,
                is_deleted = excluded.is_deleted,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(message_id)
        .bind(uid)
        .bind(name)
        .bind(&channel.channel_id)
        .bind(i64::from(channel.channel_type.as_u8()))
        .bind(&stored_emoji)
        .bind(seq.as_i64())
        .bind(i64::from(change.leaves_deleted()))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;
        tx.commit().await.map_err(StorageError::Database)?;

        Ok(ReactionToggled {
            change,
            record: ReactionRecord {
                message_id: message_id.to_string(),
                uid: uid.to_string(),
                name: name.to_string(),
                channel: channel.clone(),
                emoji: stored_emoji,
                seq: seq.value(),
                is_deleted: change.leaves_deleted(),
            },
        })
    }

    async fn sync_reactions(
        &self,
        channel: &ChannelKey,
        seq: u64,
        limit: u32,
    ) -> StorageResult<Vec<ReactionRecord>> {
        let order = if seq == 0 { "DESC" } else { "ASC" };
        let rows = sqlx::query_as::<_, ReactionRow>(&format!(
            r#"
            SELECT {REACTION_COLUMNS} FROM reactions
            WHERE channel_id = ?1 AND channel_type = ?2 AND seq > ?3
            ORDER BY seq {order}
            LIMIT ?4
            "#
        ))
        .bind(&channel.channel_id)
        .bind(i64::from(channel.channel_type.as_u8()))
        .bind(seq as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        let mut reactions = rows
            .into_iter()
            .map(ReactionRecord::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        if seq == 0 {
            reactions.reverse();
        }
        Ok(reactions)
    }

    async fn reactions_for(
        &self,
        message_ids: &[String],
    ) -> StorageResult<HashMap<String, Vec<ReactionRecord>>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {REACTION_COLUMNS} FROM reactions WHERE message_id IN ("
        ));
        let mut ids = builder.separated(", ");
        for message_id in message_ids {
            ids.push_bind(message_id.clone());
        }
        ids.push_unseparated(") ORDER BY seq ASC");

        let rows = builder
            .build_query_as::<ReactionRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        let mut by_message: HashMap<String, Vec<ReactionRecord>> = HashMap::new();
        for row in rows {
            let record = ReactionRecord::try_from(row)?;
            by_message
                .entry(record.message_id.clone())
                .or_default()
                .push(record);
        }
        Ok(by_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::ReactionChange;

    #[tokio::test]
    async fn three_toggles_keep_one_row_and_alternate() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let channel = ChannelKey::group("g1");
        let mut flags = Vec::new();
        let mut seqs = Vec::new();
        for _ in 0..3 {
            let toggled = storage
                .toggle_reaction("alice", "Alice", &channel, "m1", "👍")
                .await
                .unwrap();
            flags.push(toggled.record.is_deleted);
            seqs.push(toggled.record.seq);
        }
        assert_eq!(flags, vec![false, true, false]);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reactions")
            .fetch_one(&storage.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn switching_emoji_replaces() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let channel = ChannelKey::group("g1");
        storage
            .toggle_reaction("alice", "Alice", &channel, "m1", "👍")
            .await
            .unwrap();
        let toggled = storage
            .toggle_reaction("alice", "Alice", &channel, "m1", "🎉")
            .await
            .unwrap();
        assert_eq!(toggled.change, ReactionChange::Replace);
        assert_eq!(toggled.record.emoji, "🎉");
        assert!(!toggled.record.is_deleted);

        let on_message = storage
            .reactions_for(&["m1".to_string()])
            .await
            .unwrap();
        assert_eq!(on_message["m1"].len(), 1);
        assert_eq!(on_message["m1"][0].emoji, "🎉");
    }

    #[tokio::test]
    async fn retraction_keeps_emoji_and_is_synced() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let channel = ChannelKey::group("g1");
        let first = storage
            .toggle_reaction("alice", "Alice", &channel, "m1", "👍")
            .await
            .unwrap();
        storage
            .toggle_reaction("alice", "Alice", &channel, "m1", "👍")
            .await
            .unwrap();

        let changes = storage
            .sync_reactions(&channel, first.record.seq, 10)
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_deleted);
        assert_eq!(changes[0].emoji, "👍");
    }

    #[tokio::test]
    async fn cold_sync_returns_newest_rows_ascending() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let channel = ChannelKey::group("g1");
        for i in 1..=4 {
            storage
                .toggle_reaction("alice", "Alice", &channel, &format!("m{i}"), "👍")
                .await
                .unwrap();
        }
        let cold = storage.sync_reactions(&channel, 0, 2).await.unwrap();
        let ids: Vec<_> = cold.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m4"]);
    }

    #[test]
    fn view_maps_fake_channel_back_to_peer() {
        let record = ReactionRecord {
            message_id: "m1".into(),
            uid: "alice".into(),
            name: "Alice".into(),
            channel: ChannelKey::person("bob").storage_key("alice"),
            emoji: "👍".into(),
            seq: 1,
            is_deleted: false,
        };
        let view = record.to_view("alice");
        assert_eq!(view.channel_id, "bob");
        assert_eq!(record.to_view("bob").channel_id, "alice");
    }
}
