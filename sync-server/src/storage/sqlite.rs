//! SQLite storage backend for convsync-server.

use super::{VersionSequencer, WatermarkStore};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use sync_types::{ChannelKey, ChannelType, ShardIndex, Version};

/// Tables split by uid hash into `shard_count` partitions.
const SHARDED_TABLES: [&str; 4] = [
    "channel_offset",
    "device_offset",
    "user_last_offset",
    "message_user_extra",
];

/// SQLite-based storage for every sync store.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(super) pool: SqlitePool,
    shard_count: u32,
}

impl SqliteStorage {
    /// Open (or create) the database described by `config`.
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let path = config
            .database
            .to_str()
            .ok_or_else(|| StorageError::InvalidPath {
                path: config.database.clone(),
            })?;
        let options = SqliteConnectOptions::from_str(path)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self {
            pool,
            shard_count: config.shard_count.max(1),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> StorageResult<Self> {
        Self::in_memory_with_shards(5).await
    }

    /// In-memory storage with an explicit partition count.
    pub async fn in_memory_with_shards(shard_count: u32) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // A single connection: every pooled connection to :memory: is a
        // separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self {
            pool,
            shard_count: shard_count.max(1),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Number of partitions of the sharded tables.
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Physical table of `base` that owns `uid`.
    pub(super) fn shard_table(&self, base: &str, uid: &str) -> String {
        ShardIndex::of(uid, self.shard_count).table(base)
    }

    /// Open a write transaction holding the database write lock from `BEGIN`.
    ///
    /// A deferred transaction that reads first gets `SQLITE_BUSY` without
    /// waiting when another connection commits before its first write.
    /// Taking the lock up front queues writers behind `busy_timeout` instead.
    pub(super) async fn begin_write(&self) -> StorageResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(StorageError::Database)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap connectivity check for the health endpoint.
    pub async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(())
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> StorageResult<()> {
        let mut statements: Vec<String> = vec![
            r#"
            CREATE TABLE IF NOT EXISTS version_sequences (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#
            .to_string(),
            r#"
            CREATE TABLE IF NOT EXISTS sync_watermarks (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#
            .to_string(),
            r#"
            CREATE TABLE IF NOT EXISTS message_extra (
                message_id TEXT PRIMARY KEY,
                message_seq INTEGER NOT NULL DEFAULT 0,
                channel_id TEXT NOT NULL,
                channel_type INTEGER NOT NULL,
                from_uid TEXT NOT NULL DEFAULT '',
                revoke INTEGER NOT NULL DEFAULT 0,
                revoker TEXT NOT NULL DEFAULT '',
                readed_count INTEGER NOT NULL DEFAULT 0,
                content_edit TEXT NOT NULL DEFAULT '',
                content_edit_hash TEXT NOT NULL DEFAULT '',
                edited_at INTEGER NOT NULL DEFAULT 0,
                is_pinned INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#
            .to_string(),
            "CREATE INDEX IF NOT EXISTS idx_message_extra_channel_version ON message_extra(channel_id, channel_type, version)".to_string(),
            r#"
            CREATE TABLE IF NOT EXISTS member_readed (
                message_id TEXT NOT NULL,
                uid TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                channel_type INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, uid)
            )
            "#
            .to_string(),
            r#"
            CREATE TABLE IF NOT EXISTS reactions (
                message_id TEXT NOT NULL,
                uid TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                channel_id TEXT NOT NULL,
                channel_type INTEGER NOT NULL,
                emoji TEXT NOT NULL,
                seq INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (message_id, uid)
            )
            "#
            .to_string(),
            "CREATE INDEX IF NOT EXISTS idx_reactions_channel_seq ON reactions(channel_id, channel_type, seq)".to_string(),
            r#"
            CREATE TABLE IF NOT EXISTS reminders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                channel_type INTEGER NOT NULL,
                client_msg_no TEXT NOT NULL DEFAULT '',
                message_id TEXT NOT NULL,
                message_seq INTEGER NOT NULL DEFAULT 0,
                reminder_type INTEGER NOT NULL,
                uid TEXT NOT NULL DEFAULT '',
                text TEXT NOT NULL DEFAULT '',
                data TEXT,
                is_locate INTEGER NOT NULL DEFAULT 0,
                publisher TEXT NOT NULL DEFAULT '',
                version INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                UNIQUE (message_id, uid, reminder_type)
            )
            "#
            .to_string(),
            "CREATE INDEX IF NOT EXISTS idx_reminders_uid_version ON reminders(uid, version)".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_reminders_channel ON reminders(channel_id, channel_type, message_seq)".to_string(),
            r#"
            CREATE TABLE IF NOT EXISTS reminder_done (
                reminder_id INTEGER NOT NULL,
                uid TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (reminder_id, uid)
            )
            "#
            .to_string(),
            r#"
            CREATE TABLE IF NOT EXISTS conversation_extra (
                uid TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                channel_type INTEGER NOT NULL,
                browse_to INTEGER NOT NULL DEFAULT 0,
                keep_message_seq INTEGER NOT NULL DEFAULT 0,
                keep_offset_y INTEGER NOT NULL DEFAULT 0,
                draft TEXT NOT NULL DEFAULT '',
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (uid, channel_id, channel_type)
            )
            "#
            .to_string(),
            "CREATE INDEX IF NOT EXISTS idx_conversation_extra_uid_version ON conversation_extra(uid, version)".to_string(),
        ];

        for shard in ShardIndex::all(self.shard_count) {
            statements.extend(sharded_table_ddl(shard));
        }

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    pub(super) fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

fn sharded_table_ddl(shard: ShardIndex) -> Vec<String> {
    let [channel_offset, device_offset, user_last_offset, message_user_extra] =
        SHARDED_TABLES.map(|base| shard.table(base));
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {channel_offset} (
                uid TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                channel_type INTEGER NOT NULL,
                message_seq INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (uid, channel_id, channel_type)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {device_offset} (
                uid TEXT NOT NULL,
                device_uuid TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                channel_type INTEGER NOT NULL,
                message_seq INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (uid, device_uuid, channel_id, channel_type)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {user_last_offset} (
                uid TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                channel_type INTEGER NOT NULL,
                message_seq INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (uid, channel_id, channel_type)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {message_user_extra} (
                uid TEXT NOT NULL,
                message_id TEXT NOT NULL,
                message_seq INTEGER NOT NULL DEFAULT 0,
                channel_id TEXT NOT NULL,
                channel_type INTEGER NOT NULL,
                message_is_deleted INTEGER NOT NULL DEFAULT 0,
                voice_readed INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (uid, message_id)
            )
            "#
        ),
    ]
}

/// Issue the next value of `key` on an open connection or transaction.
pub(super) async fn next_version_in(
    conn: &mut SqliteConnection,
    key: &str,
) -> StorageResult<Version> {
    let value: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO version_sequences (key, value)
        VALUES (?1, 1)
        ON CONFLICT(key) DO UPDATE SET value = value + 1
        RETURNING value
        "#,
    )
    .bind(key)
    .fetch_one(&mut *conn)
    .await
    .map_err(StorageError::Database)?;

    Ok(Version::from_i64(value))
}

/// Map stored channel columns back to a key.
pub(super) fn channel_from_row(
    table: &'static str,
    channel_id: String,
    channel_type: i64,
) -> StorageResult<ChannelKey> {
    let raw = u8::try_from(channel_type).map_err(|_| StorageError::Corrupt {
        table,
        reason: format!("channel_type {channel_type} out of range"),
    })?;
    let channel_type = ChannelType::try_from(raw).map_err(|e| StorageError::Corrupt {
        table,
        reason: e.to_string(),
    })?;
    Ok(ChannelKey::new(channel_id, channel_type))
}

#[async_trait]
impl VersionSequencer for SqliteStorage {
    async fn next_version(&self, key: &str) -> StorageResult<Version> {
        let mut conn = self.pool.acquire().await.map_err(StorageError::Database)?;
        next_version_in(&mut *conn, key).await
    }
}

#[async_trait]
impl WatermarkStore for SqliteStorage {
    async fn load_watermark(&self, key: &str) -> StorageResult<Option<Version>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM sync_watermarks WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::Database)?;
        Ok(value.map(Version::from_i64))
    }

    async fn raise_watermark(&self, key: &str, version: Version) -> StorageResult<Version> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_watermarks (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = MAX(value, excluded.value),
                updated_at = excluded.updated_at
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(version.as_i64())
        .bind(Self::current_timestamp())
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(Version::from_i64(value))
    }
}
