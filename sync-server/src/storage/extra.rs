//! Message extras: channel-global facts plus per-user flags.

use super::reminder::cancel_for_message_in;
use super::sqlite::{channel_from_row, next_version_in, SqliteStorage};
use super::{
    extra_sequence_key, EditOutcome, ExtraDetail, ExtraRecord, ExtraStore, UserExtraRecord,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteConnection;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use sync_types::api::{MessageRef, ReadedMessage};
use sync_types::{ChannelKey, Version};

const EXTRA_COLUMNS: &str = "e.message_id, e.message_seq, e.channel_id, e.channel_type, \
     e.from_uid, e.revoke, e.revoker, e.readed_count, e.content_edit, e.content_edit_hash, \
     e.edited_at, e.is_pinned, e.is_deleted, e.version";

/// Hex SHA-256 of edited content, used to drop repeated edits.
pub(crate) fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[derive(sqlx::FromRow)]
struct ExtraRow {
    message_id: String,
    message_seq: i64,
    channel_id: String,
    channel_type: i64,
    from_uid: String,
    revoke: i64,
    revoker: String,
    readed_count: i64,
    content_edit: String,
    content_edit_hash: String,
    edited_at: i64,
    is_pinned: i64,
    is_deleted: i64,
    version: i64,
}

impl TryFrom<ExtraRow> for ExtraRecord {
    type Error = StorageError;

    fn try_from(row: ExtraRow) -> Result<Self, Self::Error> {
        Ok(ExtraRecord {
            message_id: row.message_id,
            message_seq: row.message_seq.max(0) as u64,
            channel: channel_from_row("message_extra", row.channel_id, row.channel_type)?,
            from_uid: row.from_uid,
            revoke: row.revoke != 0,
            revoker: row.revoker,
            readed_count: row.readed_count,
            content_edit: row.content_edit,
            content_edit_hash: row.content_edit_hash,
            edited_at: row.edited_at,
            is_pinned: row.is_pinned != 0,
            is_deleted: row.is_deleted != 0,
            version: Version::from_i64(row.version),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExtraDetailRow {
    #[sqlx(flatten)]
    extra: ExtraRow,
    readed_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct UserExtraRow {
    message_id: String,
    message_is_deleted: i64,
    voice_readed: i64,
}

/// One mutation of a message's extra row.
enum ExtraChange<'a> {
    Revoke { revoker: &'a str },
    FirstRead,
    Edit { content: &'a str, hash: &'a str },
    Pinned(bool),
    MutualDeleted,
}

impl ExtraChange<'_> {
    // ?1 message_id, ?2 message_seq, ?3 channel_id, ?4 channel_type,
    // ?5 version, ?6 now, ?7.. change-specific.
    fn sql(&self) -> &'static str {
        match self {
            Self::Revoke { .. } => {
                r#"
                INSERT INTO message_extra (message_id, message_seq, channel_id, channel_type,
                    version, created_at, updated_at, revoke, revoker, is_pinned)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1, ?7, 0)
                ON CONFLICT(message_id) DO UPDATE SET
                    message_seq = MAX(message_seq, excluded.message_seq),
                    revoke = 1, revoker = excluded.revoker, is_pinned = 0,
                    version = excluded.version, updated_at = excluded.updated_at
                "#
            }
            Self::FirstRead => {
                r#"
                INSERT INTO message_extra (message_id, message_seq, channel_id, channel_type,
                    version, created_at, updated_at, readed_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1)
                ON CONFLICT(message_id) DO UPDATE SET
                    message_seq = MAX(message_seq, excluded.message_seq),
                    readed_count = readed_count + 1,
                    version = excluded.version, updated_at = excluded.updated_at
                "#
            }
            Self::Edit { .. } => {
                r#"
                INSERT INTO message_extra (message_id, message_seq, channel_id, channel_type,
                    version, created_at, updated_at, content_edit, content_edit_hash, edited_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8, ?6)
                ON CONFLICT(message_id) DO UPDATE SET
                    message_seq = MAX(message_seq, excluded.message_seq),
                    content_edit = excluded.content_edit,
                    content_edit_hash = excluded.content_edit_hash,
                    edited_at = excluded.edited_at,
                    version = excluded.version, updated_at = excluded.updated_at
                "#
            }
            Self::Pinned(_) => {
                r#"
                INSERT INTO message_extra (message_id, message_seq, channel_id, channel_type,
                    version, created_at, updated_at, is_pinned)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
                ON CONFLICT(message_id) DO UPDATE SET
                    message_seq = MAX(message_seq, excluded.message_seq),
                    is_pinned = excluded.is_pinned,
                    version = excluded.version, updated_at = excluded.updated_at
                "#
            }
            Self::MutualDeleted => {
                r#"
                INSERT INTO message_extra (message_id, message_seq, channel_id, channel_type,
                    version, created_at, updated_at, is_deleted)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1)
                ON CONFLICT(message_id) DO UPDATE SET
                    message_seq = MAX(message_seq, excluded.message_seq),
                    is_deleted = 1,
                    version = excluded.version, updated_at = excluded.updated_at
                "#
            }
        }
    }
}

/// Apply one change under a fresh channel-scoped version.
async fn apply_in(
    conn: &mut SqliteConnection,
    message_id: &str,
    message_seq: u64,
    channel: &ChannelKey,
    change: ExtraChange<'_>,
) -> StorageResult<Version> {
    let version = next_version_in(&mut *conn, &extra_sequence_key(channel)).await?;
    let query = sqlx::query(change.sql())
        .bind(message_id)
        .bind(message_seq as i64)
        .bind(&channel.channel_id)
        .bind(i64::from(channel.channel_type.as_u8()))
        .bind(version.as_i64())
        .bind(SqliteStorage::current_timestamp());
    let query = match change {
        ExtraChange::Revoke { revoker } => query.bind(revoker),
        ExtraChange::Edit { content, hash } => query.bind(content).bind(hash),
        ExtraChange::Pinned(pinned) => query.bind(i64::from(pinned)),
        ExtraChange::FirstRead | ExtraChange::MutualDeleted => query,
    };
    query
        .execute(&mut *conn)
        .await
        .map_err(StorageError::Database)?;
    Ok(version)
}

async fn is_pinned_in(conn: &mut SqliteConnection, message_id: &str) -> StorageResult<bool> {
    let pinned: Option<i64> =
        sqlx::query_scalar("SELECT is_pinned FROM message_extra WHERE message_id = ?1")
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(StorageError::Database)?;
    Ok(pinned.unwrap_or(0) != 0)
}

impl SqliteStorage {
    /// Upsert a per-user flag column for one message.
    async fn set_user_flag_in(
        conn: &mut SqliteConnection,
        table: &str,
        column: &'static str,
        uid: &str,
        message: &MessageRef,
    ) -> StorageResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (uid, message_id, message_seq, channel_id, channel_type, {column}, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
            ON CONFLICT(uid, message_id) DO UPDATE SET
                {column} = 1, updated_at = excluded.updated_at
            "#
        ))
        .bind(uid)
        .bind(&message.message_id)
        .bind(message.message_seq as i64)
        .bind(&message.channel_id)
        .bind(i64::from(message.channel_type.as_u8()))
        .bind(Self::current_timestamp())
        .execute(&mut *conn)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }
}

#[async_trait]
impl ExtraStore for SqliteStorage {
    async fn revoke_message(&self, revoker: &str, message: &MessageRef) -> StorageResult<Version> {
        let channel = message.channel();
        let mut tx = self.begin_write().await?;
        let version = apply_in(
            &mut tx,
            &message.message_id,
            message.message_seq,
            &channel,
            ExtraChange::Revoke { revoker },
        )
        .await?;
        let cancelled = cancel_for_message_in(&mut tx, &channel, &message.message_id).await?;
        tx.commit().await.map_err(StorageError::Database)?;

        tracing::debug!(message_id = %message.message_id, %version, cancelled, "message revoked");
        Ok(version)
    }

    async fn mark_read(
        &self,
        uid: &str,
        channel: &ChannelKey,
        messages: &[ReadedMessage],
    ) -> StorageResult<u64> {
        let now = Self::current_timestamp();
        let mut tx = self.begin_write().await?;
        let mut newly_read = 0;
        for message in messages {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO member_readed (message_id, uid, channel_id, channel_type, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&message.message_id)
            .bind(uid)
            .bind(&channel.channel_id)
            .bind(i64::from(channel.channel_type.as_u8()))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?
            .rows_affected();
            if inserted == 0 {
                continue;
            }
            apply_in(
                &mut tx,
                &message.message_id,
                message.message_seq,
                channel,
                ExtraChange::FirstRead,
            )
            .await?;
            newly_read += 1;
        }
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(newly_read)
    }

    async fn set_edit(&self, message: &MessageRef, content: &str) -> StorageResult<EditOutcome> {
        let hash = content_hash(content);
        let mut tx = self.begin_write().await?;
        let stored: Option<String> =
            sqlx::query_scalar("SELECT content_edit_hash FROM message_extra WHERE message_id = ?1")
                .bind(&message.message_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StorageError::Database)?;
        if stored.as_deref() == Some(hash.as_str()) {
            return Ok(EditOutcome::Unchanged);
        }
        let version = apply_in(
            &mut tx,
            &message.message_id,
            message.message_seq,
            &message.channel(),
            ExtraChange::Edit {
                content,
                hash: &hash,
            },
        )
        .await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(EditOutcome::Applied(version))
    }

    async fn set_pinned(&self, message: &MessageRef, pinned: bool) -> StorageResult<Version> {
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        apply_in(
            &mut conn,
            &message.message_id,
            message.message_seq,
            &message.channel(),
            ExtraChange::Pinned(pinned),
        )
        .await
    }

    async fn toggle_pinned(&self, message: &MessageRef) -> StorageResult<(bool, Version)> {
        let mut tx = self.begin_write().await?;
        let pinned = !is_pinned_in(&mut tx, &message.message_id).await?;
        let version = apply_in(
            &mut tx,
            &message.message_id,
            message.message_seq,
            &message.channel(),
            ExtraChange::Pinned(pinned),
        )
        .await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok((pinned, version))
    }

    async fn mark_mutual_deleted(&self, message: &MessageRef) -> StorageResult<Version> {
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        apply_in(
            &mut conn,
            &message.message_id,
            message.message_seq,
            &message.channel(),
            ExtraChange::MutualDeleted,
        )
        .await
    }

    async fn mark_user_deleted(&self, uid: &str, messages: &[MessageRef]) -> StorageResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let table = self.shard_table("message_user_extra", uid);
        let mut tx = self.begin_write().await?;
        for message in messages {
            Self::set_user_flag_in(&mut tx, &table, "message_is_deleted", uid, message).await?;
        }
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(())
    }

    async fn mark_voice_read(&self, uid: &str, message: &MessageRef) -> StorageResult<()> {
        let table = self.shard_table("message_user_extra", uid);
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        Self::set_user_flag_in(&mut conn, &table, "voice_readed", uid, message).await
    }

    async fn sync_extras(
        &self,
        channel: &ChannelKey,
        version: Version,
        limit: u32,
    ) -> StorageResult<Vec<ExtraRecord>> {
        // Cold start: newest rows first, then flip to ascending.
        let order = if version.is_zero() { "DESC" } else { "ASC" };
        let rows = sqlx::query_as::<_, ExtraRow>(&format!(
            r#"
            SELECT {EXTRA_COLUMNS} FROM message_extra e
            WHERE e.channel_id = ?1 AND e.channel_type = ?2 AND e.version > ?3
            ORDER BY e.version {order}
            LIMIT ?4
            "#
        ))
        .bind(&channel.channel_id)
        .bind(i64::from(channel.channel_type.as_u8()))
        .bind(version.as_i64())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        let mut extras = rows
            .into_iter()
            .map(ExtraRecord::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        if version.is_zero() {
            extras.reverse();
        }
        Ok(extras)
    }

    async fn extras_for(
        &self,
        message_ids: &[String],
        uid: &str,
    ) -> StorageResult<HashMap<String, ExtraDetail>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {EXTRA_COLUMNS}, r.created_at AS readed_at FROM message_extra e \
             LEFT JOIN member_readed r ON r.message_id = e.message_id AND r.uid = "
        ));
        builder.push_bind(uid.to_string());
        builder.push(" WHERE e.message_id IN (");
        let mut ids = builder.separated(", ");
        for message_id in message_ids {
            ids.push_bind(message_id.clone());
        }
        ids.push_unseparated(")");

        let rows = builder
            .build_query_as::<ExtraDetailRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        let mut details = HashMap::with_capacity(rows.len());
        for row in rows {
            let extra = ExtraRecord::try_from(row.extra)?;
            details.insert(
                extra.message_id.clone(),
                ExtraDetail {
                    extra,
                    readed: row.readed_at.is_some(),
                    readed_at: row.readed_at.unwrap_or(0),
                },
            );
        }
        Ok(details)
    }

    async fn user_extras_for(
        &self,
        uid: &str,
        message_ids: &[String],
    ) -> StorageResult<HashMap<String, UserExtraRecord>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let table = self.shard_table("message_user_extra", uid);
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT message_id, message_is_deleted, voice_readed FROM {table} WHERE uid = "
        ));
        builder.push_bind(uid.to_string());
        builder.push(" AND message_id IN (");
        let mut ids = builder.separated(", ");
        for message_id in message_ids {
            ids.push_bind(message_id.clone());
        }
        ids.push_unseparated(")");

        let rows = builder
            .build_query_as::<UserExtraRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.message_id.clone(),
                    UserExtraRecord {
                        message_id: row.message_id,
                        is_deleted: row.message_is_deleted != 0,
                        voice_readed: row.voice_readed != 0,
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ReminderStore, VersionSequencer};
    use sync_core::ReminderDraft;
    use sync_types::{ChannelType, ReminderType};

    fn message(id: &str, seq: u64) -> MessageRef {
        MessageRef {
            message_id: id.to_string(),
            message_seq: seq,
            channel_id: "g1".into(),
            channel_type: ChannelType::Group,
        }
    }

    fn read(id: &str, seq: u64) -> ReadedMessage {
        ReadedMessage {
            message_id: id.to_string(),
            message_seq: seq,
        }
    }

    #[tokio::test]
    async fn every_mutation_bumps_the_version() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let msg = message("m1", 1);
        let v1 = storage.set_pinned(&msg, true).await.unwrap();
        let v2 = storage.mark_mutual_deleted(&msg).await.unwrap();
        let v3 = storage.revoke_message("alice", &msg).await.unwrap();
        assert!(v1 < v2 && v2 < v3);

        let extras = storage
            .extras_for(&["m1".to_string()], "alice")
            .await
            .unwrap();
        let extra = &extras["m1"].extra;
        assert!(extra.revoke);
        assert_eq!(extra.revoker, "alice");
        assert!(!extra.is_pinned, "revoke unpins");
        assert!(extra.is_deleted);
        assert_eq!(extra.version, v3);
    }

    #[tokio::test]
    async fn identical_edit_bumps_once() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let msg = message("m1", 1);
        let first = storage.set_edit(&msg, "fixed typo").await.unwrap();
        let second = storage.set_edit(&msg, "fixed typo").await.unwrap();
        assert!(matches!(first, EditOutcome::Applied(_)));
        assert_eq!(second, EditOutcome::Unchanged);

        let third = storage.set_edit(&msg, "fixed again").await.unwrap();
        assert!(matches!(third, EditOutcome::Applied(v) if v > Version::new(1)));

        let synced = storage
            .sync_extras(&msg.channel(), Version::zero(), 10)
            .await
            .unwrap();
        assert_eq!(synced[0].content_edit, "fixed again");
        assert_eq!(synced[0].content_edit_hash, content_hash("fixed again"));
    }

    #[tokio::test]
    async fn reads_count_each_member_once() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let channel = ChannelKey::group("g1");
        assert_eq!(
            storage
                .mark_read("alice", &channel, &[read("m1", 1), read("m2", 2)])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            storage
                .mark_read("alice", &channel, &[read("m1", 1)])
                .await
                .unwrap(),
            0
        );
        storage
            .mark_read("bob", &channel, &[read("m1", 1)])
            .await
            .unwrap();

        let ids = vec!["m1".to_string(), "m2".to_string()];
        let for_alice = storage.extras_for(&ids, "alice").await.unwrap();
        assert_eq!(for_alice["m1"].extra.readed_count, 2);
        assert!(for_alice["m1"].readed);
        assert_eq!(for_alice["m1"].to_view().readed, 1);

        let for_carol = storage.extras_for(&ids, "carol").await.unwrap();
        assert!(!for_carol["m2"].readed);
        assert_eq!(for_carol["m2"].readed_at, 0);
    }

    #[tokio::test]
    async fn toggle_pinned_flips() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let msg = message("m1", 1);
        assert!(storage.toggle_pinned(&msg).await.unwrap().0);
        assert!(!storage.toggle_pinned(&msg).await.unwrap().0);
    }

    #[tokio::test]
    async fn cold_sync_returns_newest_rows_ascending() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        for i in 1..=5 {
            storage
                .set_pinned(&message(&format!("m{i}"), i), true)
                .await
                .unwrap();
        }
        let channel = ChannelKey::group("g1");

        let cold = storage
            .sync_extras(&channel, Version::zero(), 2)
            .await
            .unwrap();
        let ids: Vec<_> = cold.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m5"]);

        let incremental = storage
            .sync_extras(&channel, Version::new(1), 2)
            .await
            .unwrap();
        let ids: Vec<_> = incremental.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn versions_are_scoped_per_channel() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.set_pinned(&message("m1", 1), true).await.unwrap();
        let other = MessageRef {
            channel_id: "g2".into(),
            ..message("m9", 1)
        };
        assert_eq!(
            storage.set_pinned(&other, true).await.unwrap(),
            Version::new(1)
        );
        assert_eq!(
            storage
                .next_version(&extra_sequence_key(&ChannelKey::group("g1")))
                .await
                .unwrap(),
            Version::new(2)
        );
    }

    #[tokio::test]
    async fn user_delete_is_private() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let msgs = vec![message("m1", 1), message("m2", 2)];
        storage.mark_user_deleted("alice", &msgs).await.unwrap();
        storage.mark_voice_read("alice", &msgs[0]).await.unwrap();

        let ids = vec!["m1".to_string(), "m2".to_string()];
        let alice = storage.user_extras_for("alice", &ids).await.unwrap();
        assert!(alice["m1"].is_deleted);
        assert!(alice["m1"].voice_readed);
        assert!(!alice["m2"].voice_readed);

        assert!(storage.user_extras_for("bob", &ids).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revoke_retracts_reminders_in_the_same_transaction() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let msg = message("m1", 1);
        storage
            .insert_reminders(&[ReminderDraft {
                channel: msg.channel(),
                client_msg_no: "c1".into(),
                message_id: "m1".into(),
                message_seq: 1,
                reminder_type: ReminderType::MentionMe,
                publisher: "bob".into(),
                uid: "alice".into(),
                text: ReminderType::MentionMe.text().into(),
                data: None,
                is_locate: true,
            }])
            .await
            .unwrap();

        storage.revoke_message("bob", &msg).await.unwrap();
        assert!(storage
            .sync_reminders("alice", Version::zero(), &[], 10)
            .await
            .unwrap()
            .is_empty());
    }
}
