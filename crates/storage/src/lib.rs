use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{MessageId, MessageKind, ReactionId, ReactionSummary, UserId, UserSummary},
    protocol::OutgoingMessage,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: UserId,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_pic: Option<String>,
    pub is_active: bool,
}

impl StoredUser {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
            profile_pic: self.profile_pic.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: Option<String>,
    pub attachment: Option<String>,
    pub message_type: MessageKind,
    pub location_lat: Option<f64>,
    pub location_lng: Option<f64>,
    pub is_read: bool,
    pub is_deleted: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn involves(&self, user_id: UserId) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }

    pub fn preview(&self) -> String {
        match (&self.content, &self.attachment) {
            (Some(content), _) if !content.is_empty() => content.clone(),
            (_, Some(_)) => "📎 Media".to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionChange {
    Added,
    Replaced,
    Removed,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub peer: StoredUser,
    pub last_message: StoredMessage,
    pub unread_count: i64,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub filename: String,
    pub uploader_id: UserId,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, attachment, message_type, location_lat, location_lng, is_read, is_deleted, edited_at, created_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn set_user_active(&self, user_id: UserId, active: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, first_name, last_name, profile_pic, is_active FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn load_user_by_username(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, first_name, last_name, profile_pic, is_active FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn insert_message(
        &self,
        sender_id: UserId,
        message: &OutgoingMessage,
    ) -> Result<StoredMessage> {
        let created_at = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO messages (sender_id, receiver_id, content, attachment, message_type, location_lat, location_lng, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(sender_id.0)
        .bind(message.to.0)
        .bind(message.content.as_deref())
        .bind(message.attachment.as_deref())
        .bind(message.message_type.as_str())
        .bind(message.location_lat)
        .bind(message.location_lng)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed storing message from {sender_id} to {}", message.to))?;
        Ok(message_from_row(&row))
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| message_from_row(&r)))
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> Result<DateTime<Utc>> {
        let edited_at = Utc::now();
        sqlx::query("UPDATE messages SET content = ?, edited_at = ? WHERE id = ?")
            .bind(content)
            .bind(edited_at)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(edited_at)
    }

    pub async fn soft_delete_message(&self, message_id: MessageId) -> Result<()> {
        sqlx::query("UPDATE messages SET is_deleted = 1 WHERE id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies a reaction with toggle semantics: the same type twice removes it,
    /// a different type replaces the user's previous reaction.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        reaction_type: &str,
    ) -> Result<ReactionChange> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT id, reaction_type FROM message_reactions WHERE message_id = ? AND user_id = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let change = match existing {
            Some(row) if row.get::<String, _>(1) == reaction_type => {
                sqlx::query("DELETE FROM message_reactions WHERE id = ?")
                    .bind(row.get::<i64, _>(0))
                    .execute(&mut *tx)
                    .await?;
                ReactionChange::Removed
            }
            Some(row) => {
                sqlx::query("UPDATE message_reactions SET reaction_type = ? WHERE id = ?")
                    .bind(reaction_type)
                    .bind(row.get::<i64, _>(0))
                    .execute(&mut *tx)
                    .await?;
                ReactionChange::Replaced
            }
            None => {
                sqlx::query(
                    "INSERT INTO message_reactions (message_id, user_id, reaction_type) VALUES (?, ?, ?)",
                )
                .bind(message_id.0)
                .bind(user_id.0)
                .bind(reaction_type)
                .execute(&mut *tx)
                .await?;
                ReactionChange::Added
            }
        };
        tx.commit().await?;
        Ok(change)
    }

    pub async fn remove_reaction(&self, message_id: MessageId, user_id: UserId) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND user_id = ?")
                .bind(message_id.0)
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_reactions(&self, message_id: MessageId) -> Result<Vec<ReactionSummary>> {
        let rows = sqlx::query(
            "SELECT r.id, r.user_id, r.reaction_type, u.username, u.profile_pic
             FROM message_reactions r
             INNER JOIN users u ON u.id = r.user_id
             WHERE r.message_id = ?
             ORDER BY r.id ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let user_id = UserId(r.get::<i64, _>(1));
                ReactionSummary {
                    id: ReactionId(r.get::<i64, _>(0)),
                    user_id,
                    reaction_type: r.get::<String, _>(2),
                    user: UserSummary {
                        id: user_id,
                        username: r.get::<String, _>(3),
                        profile_pic: r.get::<Option<String>, _>(4),
                        first_name: None,
                        last_name: None,
                    },
                }
            })
            .collect())
    }

    /// Non-deleted messages exchanged between two users, oldest first.
    pub async fn list_conversation(
        &self,
        user_id: UserId,
        peer_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE ((sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?))
               AND is_deleted = 0
             ORDER BY id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(user_id.0)
        .bind(peer_id.0)
        .bind(peer_id.0)
        .bind(user_id.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows.iter().map(message_from_row).collect())
    }

    pub async fn mark_read(&self, reader_id: UserId, message_ids: &[MessageId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message_id in message_ids {
            sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ? AND receiver_id = ?")
                .bind(message_id.0)
                .bind(reader_id.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// One entry per peer holding the latest non-deleted message, newest first.
    pub async fn list_conversations(&self, user_id: UserId) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE (sender_id = ? OR receiver_id = ?) AND is_deleted = 0
             ORDER BY id DESC"
        ))
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut seen = HashSet::new();
        let mut conversations = Vec::new();
        for row in rows {
            let message = message_from_row(&row);
            let peer_id = if message.sender_id == user_id {
                message.receiver_id
            } else {
                message.sender_id
            };
            if !seen.insert(peer_id) {
                continue;
            }
            let Some(peer) = self.load_user(peer_id).await? else {
                continue;
            };
            let unread_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(id) FROM messages
                 WHERE sender_id = ? AND receiver_id = ? AND is_read = 0 AND is_deleted = 0",
            )
            .bind(peer_id.0)
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;
            conversations.push(StoredConversation {
                peer,
                last_message: message,
                unread_count,
            });
        }
        Ok(conversations)
    }

    pub async fn store_file(
        &self,
        uploader_id: UserId,
        filename: &str,
        mime_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO uploaded_files (filename, uploader_id, mime_type, bytes) VALUES (?, ?, ?, ?)",
        )
        .bind(filename)
        .bind(uploader_id.0)
        .bind(mime_type)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed storing upload '{filename}'"))?;
        Ok(())
    }

    pub async fn load_file(&self, filename: &str) -> Result<Option<StoredFile>> {
        let row = sqlx::query(
            "SELECT filename, uploader_id, mime_type, bytes FROM uploaded_files WHERE filename = ?",
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredFile {
            filename: r.get::<String, _>(0),
            uploader_id: UserId(r.get::<i64, _>(1)),
            mime_type: r.get::<Option<String>, _>(2),
            bytes: r.get::<Vec<u8>, _>(3),
        }))
    }
}

fn user_from_row(r: &SqliteRow) -> StoredUser {
    StoredUser {
        id: UserId(r.get::<i64, _>(0)),
        username: r.get::<String, _>(1),
        first_name: r.get::<Option<String>, _>(2),
        last_name: r.get::<Option<String>, _>(3),
        profile_pic: r.get::<Option<String>, _>(4),
        is_active: r.get::<bool, _>(5),
    }
}

fn message_from_row(r: &SqliteRow) -> StoredMessage {
    StoredMessage {
        id: MessageId(r.get::<i64, _>(0)),
        sender_id: UserId(r.get::<i64, _>(1)),
        receiver_id: UserId(r.get::<i64, _>(2)),
        content: r.get::<Option<String>, _>(3),
        attachment: r.get::<Option<String>, _>(4),
        message_type: MessageKind::parse(&r.get::<String, _>(5)).unwrap_or_default(),
        location_lat: r.get::<Option<f64>, _>(6),
        location_lng: r.get::<Option<f64>, _>(7),
        is_read: r.get::<bool, _>(8),
        is_deleted: r.get::<bool, _>(9),
        edited_at: r.get::<Option<DateTime<Utc>>, _>(10),
        created_at: r.get::<DateTime<Utc>, _>(11),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

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
