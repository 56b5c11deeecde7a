use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{ChannelId, MessageId, MessageType, UserId},
    protocol::{Message, MessageQuery},
};

/// Upper bound for a single page, whatever the caller asks for.
pub const MAX_PAGE_SIZE: u32 = 500;

const MESSAGE_COLUMNS: &str = "id, channel_id, user_id, content, message_type, reply_to, created_at_us, updated_at_us, is_deleted";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own empty database.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts the message unless a row with the same id already exists.
    ///
    /// Returns `true` when a row was written. Replaying a create is a no-op, so a
    /// client may retry with the id it generated without producing a duplicate.
    pub async fn create_message(&self, message: &Message) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO messages (id, channel_id, user_id, content, message_type, reply_to, created_at_us, updated_at_us, is_deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(message.id.as_str())
        .bind(message.channel_id.as_str())
        .bind(message.user_id.as_str())
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(message.reply_to.as_ref().map(MessageId::as_str))
        .bind(message.created_at.timestamp_micros())
        .bind(message.updated_at.timestamp_micros())
        .bind(message.is_deleted)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert message {}", message.id))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn load_message(&self, message_id: &MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    /// Oldest-first page of a channel's messages, ties in insertion order.
    pub async fn list_channel_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
        let sql = if query.include_deleted {
            format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = ?
                 ORDER BY created_at_us ASC, rowid ASC
                 LIMIT ?"
            )
        } else {
            format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE channel_id = ? AND is_deleted = 0
                 ORDER BY created_at_us ASC, rowid ASC
                 LIMIT ?"
            )
        };
        let rows = sqlx::query(&sql)
            .bind(query.channel_id.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to list messages for channel {}", query.channel_id))?;

        rows.iter().map(message_from_row).collect()
    }

    /// Overwrites the mutable fields of an existing message. `created_at` never moves.
    pub async fn update_message(&self, message: &Message) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages
             SET content = ?, message_type = ?, reply_to = ?, updated_at_us = ?, is_deleted = ?
             WHERE id = ?",
        )
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(message.reply_to.as_ref().map(MessageId::as_str))
        .bind(message.updated_at.timestamp_micros())
        .bind(message.is_deleted)
        .bind(message.id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update message {}", message.id))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn soft_delete_message(
        &self,
        message_id: &MessageId,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET is_deleted = 1, updated_at_us = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(deleted_at.timestamp_micros())
        .bind(message_id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to delete message {message_id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: MessageId(row.get::<String, _>(0)),
        channel_id: ChannelId(row.get::<String, _>(1)),
        user_id: UserId(row.get::<String, _>(2)),
        content: row.get::<String, _>(3),
        message_type: MessageType::from(row.get::<String, _>(4)),
        reply_to: row.get::<Option<String>, _>(5).map(MessageId),
        created_at: timestamp_from_micros(row.get::<i64, _>(6))?,
        updated_at: timestamp_from_micros(row.get::<i64, _>(7))?,
        is_deleted: row.get::<bool, _>(8),
    })
}

fn timestamp_from_micros(micros: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| anyhow!("timestamp out of range: {micros}us"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
