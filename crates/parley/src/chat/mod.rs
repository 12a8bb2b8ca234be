//! Chats and messages: the minimal persistence the run core needs.

pub mod models;
pub mod repository;

pub use models::{Chat, ChatMessage, NewChatMessage};
pub use repository::ChatRepository;
