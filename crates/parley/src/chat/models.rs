//! Chat data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A conversation owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    /// Set when a run finishes while the user is not watching.
    pub unread: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A message in a chat's tree. `parts` and `attachments` are JSON blobs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    /// user | assistant | system
    pub role: String,
    /// JSON array of message parts.
    pub parts: String,
    /// JSON array of attachments.
    pub attachments: String,
    /// Parent message in the branching tree; NULL for roots.
    pub parent_id: Option<String>,
    pub created_at: String,
}

/// Input for persisting a message.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub id: String,
    pub chat_id: String,
    pub role: String,
    pub parts: serde_json::Value,
    pub attachments: serde_json::Value,
    pub parent_id: Option<String>,
}
