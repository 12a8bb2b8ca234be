//! Generation run data models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;

/// Lifecycle status of a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Terminal statuses are immutable: once reached, neither status nor
    /// cursor may change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// One assistant turn being generated, as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationRun {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    /// `queued | running | succeeded | failed | canceled`
    pub status: String,
    pub model_id: String,
    /// JSON snapshot of the prompt context at enqueue time. Immutable.
    pub messages: String,
    pub user_message_id: String,
    /// The message this run is populating.
    pub assistant_message_id: String,
    /// JSON personalization settings snapshot.
    pub personalization: String,
    /// Highest sequence number assigned to this run's events.
    pub cursor: i64,
    /// Reason code when failed.
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl GenerationRun {
    pub fn status(&self) -> RunStatus {
        self.status.parse().unwrap_or(RunStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Input for creating a run at enqueue time.
#[derive(Debug, Clone)]
pub struct NewGenerationRun {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub model_id: String,
    /// Prompt context snapshot.
    pub messages: Value,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub personalization: Value,
}

/// One increment of run output.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunEvent {
    pub run_id: String,
    /// Strictly increasing per run; assigned atomically with the cursor bump.
    pub seq: i64,
    /// Opaque bounded-size JSON payload.
    pub chunk: String,
    pub created_at: String,
}
