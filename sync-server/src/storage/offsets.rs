//! Channel, device and user-last offsets, hash-partitioned by uid.

use super::reminder::{done_candidates_in, mark_done_in};
use super::sqlite::{channel_from_row, SqliteStorage};
use super::OffsetStore;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use sync_types::ChannelKey;

#[derive(sqlx::FromRow)]
struct OffsetRow {
    channel_id: String,
    channel_type: i64,
    message_seq: i64,
}

fn collect_offsets(
    table: &'static str,
    rows: Vec<OffsetRow>,
) -> StorageResult<HashMap<ChannelKey, u64>> {
    let mut offsets = HashMap::with_capacity(rows.len());
    for row in rows {
        let channel = channel_from_row(table, row.channel_id, row.channel_type)?;
        let seq = row.message_seq.max(0) as u64;
        let entry = offsets.entry(channel).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }
    Ok(offsets)
}

/// Max-merge upsert into a `(uid, channel)` keyed offset table.
async fn merge_user_offset_in(
    conn: &mut SqliteConnection,
    table: &str,
    uid: &str,
    channel: &ChannelKey,
    seq: u64,
) -> StorageResult<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO {table} (uid, channel_id, channel_type, message_seq, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(uid, channel_id, channel_type) DO UPDATE SET
            message_seq = MAX(message_seq, excluded.message_seq),
            updated_at = excluded.updated_at
        "#
    ))
    .bind(uid)
    .bind(&channel.channel_id)
    .bind(i64::from(channel.channel_type.as_u8()))
    .bind(seq as i64)
    .bind(SqliteStorage::current_timestamp())
    .execute(&mut *conn)
    .await
    .map_err(StorageError::Database)?;
    Ok(())
}

/// Max-merge upsert into a device offset table.
async fn merge_device_offset_in(
    conn: &mut SqliteConnection,
    table: &str,
    uid: &str,
    device_uuid: &str,
    channel: &ChannelKey,
    seq: u64,
) -> StorageResult<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO {table} (uid, device_uuid, channel_id, channel_type, message_seq, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(uid, device_uuid, channel_id, channel_type) DO UPDATE SET
            message_seq = MAX(message_seq, excluded.message_seq),
            updated_at = excluded.updated_at
        "#
    ))
    .bind(uid)
    .bind(device_uuid)
    .bind(&channel.channel_id)
    .bind(i64::from(channel.channel_type.as_u8()))
    .bind(seq as i64)
    .bind(SqliteStorage::current_timestamp())
    .execute(&mut *conn)
    .await
    .map_err(StorageError::Database)?;
    Ok(())
}

async fn user_rows_in(
    conn: &mut SqliteConnection,
    table: &str,
    uid: &str,
) -> StorageResult<Vec<OffsetRow>> {
    sqlx::query_as::<_, OffsetRow>(&format!(
        "SELECT channel_id, channel_type, message_seq FROM {table} WHERE uid = ?1"
    ))
    .bind(uid)
    .fetch_all(&mut *conn)
    .await
    .map_err(StorageError::Database)
}

async fn device_rows_in(
    conn: &mut SqliteConnection,
    table: &str,
    uid: &str,
    device_uuid: &str,
) -> StorageResult<Vec<OffsetRow>> {
    sqlx::query_as::<_, OffsetRow>(&format!(
        "SELECT channel_id, channel_type, message_seq FROM {table} WHERE uid = ?1 AND device_uuid = ?2"
    ))
    .bind(uid)
    .bind(device_uuid)
    .fetch_all(&mut *conn)
    .await
    .map_err(StorageError::Database)
}

impl SqliteStorage {
    /// Channel offset rows of `uid` (possibly empty) for the given channel ids.
    async fn channel_rows(&self, uid: &str, channels: &[ChannelKey]) -> StorageResult<Vec<OffsetRow>> {
        let table = self.shard_table("channel_offset", uid);
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT channel_id, channel_type, message_seq FROM {table} WHERE uid = "
        ));
        builder.push_bind(uid.to_string());
        builder.push(" AND channel_id IN (");
        let mut ids = builder.separated(", ");
        for channel in channels {
            ids.push_bind(channel.channel_id.clone());
        }
        ids.push_unseparated(")");

        builder
            .build_query_as::<OffsetRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::Database)
    }
}

#[async_trait]
impl OffsetStore for SqliteStorage {
    async fn advance_channel_offset(
        &self,
        uid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<()> {
        let table = self.shard_table("channel_offset", uid);
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        merge_user_offset_in(&mut conn, &table, uid, channel, seq).await
    }

    async fn advance_device_offset(
        &self,
        uid: &str,
        device_uuid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<()> {
        let table = self.shard_table("device_offset", uid);
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        merge_device_offset_in(&mut conn, &table, uid, device_uuid, channel, seq).await
    }

    async fn advance_user_last_offset(
        &self,
        uid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<()> {
        let table = self.shard_table("user_last_offset", uid);
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        merge_user_offset_in(&mut conn, &table, uid, channel, seq).await
    }

    async fn channel_offset(
        &self,
        uid: &str,
        channel: &ChannelKey,
    ) -> StorageResult<Option<u64>> {
        let offsets = self
            .channel_offsets_for(uid, std::slice::from_ref(channel))
            .await?;
        Ok(offsets.get(channel).copied())
    }

    async fn channel_offsets_for(
        &self,
        uid: &str,
        channels: &[ChannelKey],
    ) -> StorageResult<HashMap<ChannelKey, u64>> {
        if channels.is_empty() {
            return Ok(HashMap::new());
        }
        let mut rows = self.channel_rows(uid, channels).await?;
        // Channel-wide offsets are stored under the empty uid.
        if !uid.is_empty() {
            rows.extend(self.channel_rows("", channels).await?);
        }
        let mut offsets = collect_offsets("channel_offset", rows)?;
        offsets.retain(|channel, _| channels.contains(channel));
        Ok(offsets)
    }

    async fn device_offsets(
        &self,
        uid: &str,
        device_uuid: &str,
    ) -> StorageResult<HashMap<ChannelKey, u64>> {
        let table = self.shard_table("device_offset", uid);
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        let rows = device_rows_in(&mut conn, &table, uid, device_uuid).await?;
        collect_offsets("device_offset", rows)
    }

    async fn user_last_offsets(&self, uid: &str) -> StorageResult<HashMap<ChannelKey, u64>> {
        let table = self.shard_table("user_last_offset", uid);
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        let rows = user_rows_in(&mut conn, &table, uid).await?;
        collect_offsets("user_last_offset", rows)
    }

    async fn device_offsets_or_seed(
        &self,
        uid: &str,
        device_uuid: &str,
    ) -> StorageResult<HashMap<ChannelKey, u64>> {
        let device_table = self.shard_table("device_offset", uid);
        let last_table = self.shard_table("user_last_offset", uid);

        let mut tx = self.begin_write().await?;
        let rows = device_rows_in(&mut tx, &device_table, uid, device_uuid).await?;
        if !rows.is_empty() {
            return collect_offsets("device_offset", rows);
        }

        let seed = collect_offsets(
            "user_last_offset",
            user_rows_in(&mut tx, &last_table, uid).await?,
        )?;
        if seed.is_empty() {
            return Ok(seed);
        }
        for (channel, seq) in &seed {
            merge_device_offset_in(&mut tx, &device_table, uid, device_uuid, channel, *seq)
                .await?;
        }
        tx.commit().await.map_err(StorageError::Database)?;

        tracing::debug!(uid, device_uuid, channels = seed.len(), "seeded device offsets");
        Ok(seed)
    }

    async fn persist_ack(
        &self,
        uid: &str,
        device_uuid: Option<&str>,
        offsets: &[(ChannelKey, u64)],
    ) -> StorageResult<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let last_table = self.shard_table("user_last_offset", uid);
        let device_table = self.shard_table("device_offset", uid);

        let mut tx = self.begin_write().await?;
        for (channel, seq) in offsets {
            merge_user_offset_in(&mut tx, &last_table, uid, channel, *seq).await?;
            if let Some(device_uuid) = device_uuid {
                merge_device_offset_in(&mut tx, &device_table, uid, device_uuid, channel, *seq)
                    .await?;
            }
        }
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(())
    }

    async fn reset_channel_offset(
        &self,
        uid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<()> {
        let table = self.shard_table("channel_offset", uid);
        let mut tx = self.begin_write().await?;
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE uid = ?1 AND channel_id = ?2 AND channel_type = ?3"
        ))
        .bind(uid)
        .bind(&channel.channel_id)
        .bind(i64::from(channel.channel_type.as_u8()))
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Database)?;
        merge_user_offset_in(&mut tx, &table, uid, channel, seq).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(())
    }

    async fn reconcile_device_offsets(&self, uid: &str, device_uuid: &str) -> StorageResult<u64> {
        let device_table = self.shard_table("device_offset", uid);
        let last_table = self.shard_table("user_last_offset", uid);

        let mut tx = self.begin_write().await?;
        let last = collect_offsets(
            "user_last_offset",
            user_rows_in(&mut tx, &last_table, uid).await?,
        )?;
        for (channel, seq) in &last {
            merge_device_offset_in(&mut tx, &device_table, uid, device_uuid, channel, *seq)
                .await?;
        }
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(last.len() as u64)
    }

    async fn clear_channel(
        &self,
        uid: &str,
        channel: &ChannelKey,
        seq: u64,
    ) -> StorageResult<bool> {
        let table = self.shard_table("channel_offset", uid);
        let mut tx = self.begin_write().await?;

        let current: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT message_seq FROM {table} WHERE uid = ?1 AND channel_id = ?2 AND channel_type = ?3"
        ))
        .bind(uid)
        .bind(&channel.channel_id)
        .bind(i64::from(channel.channel_type.as_u8()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::Database)?;
        if current.is_some_and(|current| current.max(0) as u64 >= seq) {
            return Ok(false);
        }

        merge_user_offset_in(&mut tx, &table, uid, channel, seq).await?;
        let reminder_ids = done_candidates_in(&mut tx, uid, channel, seq).await?;
        mark_done_in(&mut tx, &reminder_ids, uid).await?;
        tx.commit().await.map_err(StorageError::Database)?;
        Ok(true)
    }
}
