//! Chat and message persistence.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{Chat, ChatMessage, NewChatMessage};

const CHAT_COLUMNS: &str = "id, user_id, title, unread, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, role, parts, attachments, parent_id, created_at";

/// Repository for chats and their message trees.
#[derive(Debug, Clone)]
pub struct ChatRepository {
    pool: SqlitePool,
}

impl ChatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a chat.
    pub async fn create_chat(&self, id: &str, user_id: &str, title: &str) -> Result<Chat> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO chats (id, user_id, title, unread, created_at, updated_at)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(title)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("creating chat")?;

        self.get_chat_required(id).await
    }

    /// Get a chat by ID.
    pub async fn get_chat(&self, id: &str) -> Result<Option<Chat>> {
        let query = format!("SELECT {} FROM chats WHERE id = ?", CHAT_COLUMNS);
        sqlx::query_as::<_, Chat>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching chat")
    }

    async fn get_chat_required(&self, id: &str) -> Result<Chat> {
        match self.get_chat(id).await? {
            Some(chat) => Ok(chat),
            None => anyhow::bail!("chat not found: {}", id),
        }
    }

    /// Flag a chat as having unread assistant output.
    pub async fn set_unread(&self, chat_id: &str, user_id: &str, unread: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE chats SET unread = ?, updated_at = ? WHERE id = ? AND user_id = ?")
            .bind(unread)
            .bind(&now)
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("updating chat unread flag")?;
        Ok(())
    }

    /// Persist a batch of messages (typically the user message plus the
    /// assistant placeholder) in one transaction. Message ids are chosen by
    /// the client, so a resubmitted id is skipped rather than rejected.
    pub async fn save_messages(&self, messages: &[NewChatMessage]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.context("beginning message save")?;
        for message in messages {
            sqlx::query(
                r#"
                INSERT INTO messages (id, chat_id, role, parts, attachments, parent_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&message.id)
            .bind(&message.chat_id)
            .bind(&message.role)
            .bind(message.parts.to_string())
            .bind(message.attachments.to_string())
            .bind(&message.parent_id)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("inserting message")?;
        }
        tx.commit().await.context("committing message save")?;
        Ok(())
    }

    /// Get a message by ID.
    pub async fn get_message(&self, id: &str) -> Result<Option<ChatMessage>> {
        let query = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
        sqlx::query_as::<_, ChatMessage>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching message")
    }

    /// Replace a message's parts with its final content.
    pub async fn update_message_parts(
        &self,
        message_id: &str,
        parts: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("UPDATE messages SET parts = ? WHERE id = ?")
            .bind(parts.to_string())
            .bind(message_id)
            .execute(&self.pool)
            .await
            .context("updating message parts")?;
        Ok(())
    }
}
