//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthState;
use crate::chat::ChatRepository;
use crate::provider::ModelProvider;
use crate::run::{RunEventBus, RunExecutor, RunRepository};

/// Stream endpoint timing knobs. Tests shrink these to keep the suite fast.
#[derive(Clone, Debug)]
pub struct StreamTimings {
    /// Interval between `: ping` comment frames.
    pub heartbeat: Duration,
    /// Interval between status-poll fallback checks.
    pub status_poll: Duration,
    /// Poll is skipped when an event arrived within this window.
    pub recency_window: Duration,
}

impl Default for StreamTimings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            status_poll: Duration::from_secs(5),
            recency_window: Duration::from_secs(3),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runs: RunRepository,
    pub chats: ChatRepository,
    pub bus: RunEventBus,
    pub executor: RunExecutor,
    pub provider: Arc<dyn ModelProvider>,
    pub auth: AuthState,
    pub timings: StreamTimings,
}
