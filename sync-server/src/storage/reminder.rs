//! Reminders and per-user completion markers.

use super::sqlite::{channel_from_row, next_version_in, SqliteStorage};
use super::{ReminderRecord, ReminderStore, REMINDER_SEQUENCE_KEY};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use sqlx::{QueryBuilder, Sqlite};
use sync_core::ReminderDraft;
use sync_types::{ChannelKey, ReminderType, Version};

const REMINDER_COLUMNS: &str = "r.id, r.channel_id, r.channel_type, r.client_msg_no, r.message_id, \
     r.message_seq, r.reminder_type, r.uid, r.text, r.data, r.is_locate, r.publisher, r.version, \
     r.is_deleted";

#[derive(sqlx::FromRow)]
struct ReminderRow {
    id: i64,
    channel_id: String,
    channel_type: i64,
    client_msg_no: String,
    message_id: String,
    message_seq: i64,
    reminder_type: i64,
    uid: String,
    text: String,
    data: Option<String>,
    is_locate: i64,
    publisher: String,
    version: i64,
    is_deleted: i64,
}

impl TryFrom<ReminderRow> for ReminderRecord {
    type Error = StorageError;

    fn try_from(row: ReminderRow) -> Result<Self, Self::Error> {
        let reminder_type = u8::try_from(row.reminder_type)
            .ok()
            .and_then(|raw| ReminderType::try_from(raw).ok())
            .ok_or_else(|| StorageError::Corrupt {
                table: "reminders",
                reason: format!("reminder_type {}", row.reminder_type),
            })?;
        let data = match row.data {
            Some(raw) if !raw.is_empty() => {
                Some(
                    serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
                        table: "reminders",
                        reason: e.to_string(),
                    })?,
                )
            }
            _ => None,
        };
        Ok(ReminderRecord {
            id: row.id,
            channel: channel_from_row("reminders", row.channel_id, row.channel_type)?,
            client_msg_no: row.client_msg_no,
            message_id: row.message_id,
            message_seq: row.message_seq.max(0) as u64,
            reminder_type,
            uid: row.uid,
            text: row.text,
            data,
            is_locate: row.is_locate != 0,
            publisher: row.publisher,
            version: Version::from_i64(row.version),
            is_deleted: row.is_deleted != 0,
        })
    }
}

/// Soft-delete reminders, one fresh version per row.
async fn retract_ids_in(conn: &mut SqliteConnection, ids: &[i64]) -> StorageResult<u64> {
    let now = SqliteStorage::current_timestamp();
    for id in ids {
        let version = next_version_in(&mut *conn, REMINDER_SEQUENCE_KEY).await?;
        sqlx::query(
            "UPDATE reminders SET is_deleted = 1, version = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(version.as_i64())
        .bind(now)
        .bind(*id)
        .execute(&mut *conn)
        .await
        .map_err(StorageError::Database)?;
    }
    Ok(ids.len() as u64)
}

/// Retract every live reminder of a message.
pub(super) async fn cancel_for_message_in(
    conn: &mut SqliteConnection,
    channel: &ChannelKey,
    message_id: &str,
) -> StorageResult<u64> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM reminders
        WHERE channel_id = ?1 AND channel_type = ?2 AND message_id = ?3 AND is_deleted = 0
        ORDER BY id
        "#,
    )
    .bind(&channel.channel_id)
    .bind(i64::from(channel.channel_type.as_u8()))
    .bind(message_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(StorageError::Database)?;
    retract_ids_in(conn, &ids).await
}

/// Live, not-yet-done reminders of `uid` in a channel up to `seq`.
pub(super) async fn done_candidates_in(
    conn: &mut SqliteConnection,
    uid: &str,
    channel: &ChannelKey,
    seq: u64,
) -> StorageResult<Vec<i64>> {
    sqlx::query_scalar(
        r#"
        SELECT r.id FROM reminders r
        LEFT JOIN reminder_done d ON d.reminder_id = r.id AND d.uid = ?1
        WHERE (r.uid = ?1 OR r.uid = '')
          AND r.channel_id = ?2 AND r.channel_type = ?3
          AND r.message_seq <= ?4
          AND r.is_deleted = 0
          AND d.reminder_id IS NULL
        ORDER BY r.id
        "#,
    )
    .bind(uid)
    .bind(&channel.channel_id)
    .bind(i64::from(channel.channel_type.as_u8()))
    .bind(seq as i64)
    .fetch_all(&mut *conn)
    .await
    .map_err(StorageError::Database)
}

/// Append done markers for `uid`; each newly done reminder gets a fresh version.
pub(super) async fn mark_done_in(
    conn: &mut SqliteConnection,
    ids: &[i64],
    uid: &str,
) -> StorageResult<u64> {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let now = SqliteStorage::current_timestamp();
    let mut marked = 0;
    for id in sorted {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO reminder_done (reminder_id, uid, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(id)
        .bind(uid)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(StorageError::Database)?
        .rows_affected();
        if inserted == 0 {
            continue;
        }
        let version = next_version_in(&mut *conn, REMINDER_SEQUENCE_KEY).await?;
        sqlx::query("UPDATE reminders SET version = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(version.as_i64())
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(StorageError::Database)?;
        marked += 1;
    }
    Ok(marked)
}

#[async_trait]
impl ReminderStore for SqliteStorage {
    async fn insert_reminders(&self, drafts: &[ReminderDraft]) -> StorageResult<u64> {
        if drafts.is_empty() {
            return Ok(0);
        }
        let now = Self::current_timestamp();
        let mut tx = self.begin_write().await?;
        let mut created = 0;
        for draft in drafts {
            let version = next_version_in(&mut tx, REMINDER_SEQUENCE_KEY).await?;
            let data = draft.data.as_ref().map(|value| value.to_string());
            created += sqlx::query(
                r#"
                INSERT INTO reminders (
                    channel_id, channel_type, client_msg_no, message_id, message_seq,
                    reminder_type, uid, text, data, is_locate, publisher, version,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
                ON CONFLICT(message_id, uid, reminder_type) DO NOTHING
                "#,
            )
            .bind(&draft.channel.channel_id)
            .bind(i64::from(draft.channel.channel_type.as_u8()))
            .bind(&draft.client_msg_no)
            .bind(&draft.message_id)
            .bind(draft.message_seq as i64)
            .bind(i64::from(draft.reminder_type.as_u8()))
            .bind(&draft.uid)
            .bind(&draft.text)
            .bind(data)
            .bind(i64::from(draft.is_locate))
            .bind(&draft.publisher)
            .bind(version.as_i64())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Database)?
            .rows_affected();
        }
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(created)
    }

    async fn cancel_for_message(
        &self,
        channel: &ChannelKey,
        message_id: &str,
    ) -> StorageResult<u64> {
        let mut tx = self.begin_write().await?;
        let cancelled = cancel_for_message_in(&mut tx, channel, message_id).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(cancelled)
    }

    async fn cancel_for_channel_user(
        &self,
        uid: &str,
        channel: &ChannelKey,
    ) -> StorageResult<u64> {
        let mut tx = self.begin_write().await?;
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM reminders
            WHERE channel_id = ?1 AND channel_type = ?2 AND uid = ?3 AND is_deleted = 0
            ORDER BY id
            "#,
        )
        .bind(&channel.channel_id)
        .bind(i64::from(channel.channel_type.as_u8()))
        .bind(uid)
        .fetch_all(&mut *tx)
        .await
        .map_err(StorageError::Database)?;
        let cancelled = retract_ids_in(&mut tx, &ids).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(cancelled)
    }

    async fn sync_reminders(
        &self,
        uid: &str,
        version: Version,
        channel_ids: &[String],
        limit: u32,
    ) -> StorageResult<Vec<ReminderRecord>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders r \
             LEFT JOIN reminder_done d ON d.reminder_id = r.id AND d.uid = "
        ));
        builder.push_bind(uid.to_string());
        builder.push(" WHERE d.reminder_id IS NULL AND r.version > ");
        builder.push_bind(version.as_i64());
        builder.push(" AND (r.uid = ");
        builder.push_bind(uid.to_string());
        builder.push(" OR (r.uid = ''");
        if !channel_ids.is_empty() {
            builder.push(" AND r.channel_id IN (");
            let mut ids = builder.separated(", ");
            for channel_id in channel_ids {
                ids.push_bind(channel_id.clone());
            }
            ids.push_unseparated(")");
        }
        builder.push("))");
        // A fresh client has nothing to retract.
        if version.is_zero() {
            builder.push(" AND r.is_deleted = 0");
        }
        builder.push(" ORDER BY r.version ASC LIMIT ");
        builder.push_bind(i64::from(limit));

        let rows = builder
            .build_query_as::<ReminderRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        rows.into_iter().map(ReminderRecord::try_from).collect()
    }

    async fn mark_done(&self, ids: &[i64], uid: &str) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.begin_write().await?;
        let marked = mark_done_in(&mut tx, ids, uid).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(marked)
    }
}
