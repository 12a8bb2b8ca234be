//! Run scheduling and execution.
//!
//! The executor owns the queue of pending runs and the pool of in-flight
//! executions. Admission is bounded two ways: a global concurrency limit
//! and at most one active run per chat, so a chat's turns never interleave.
//! Runs execute entirely server-side; clients attach and detach freely
//! through the stream endpoint without affecting execution.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parley_protocol::{reduce_event, MessagePart, StreamEvent};

use crate::chat::ChatRepository;
use crate::config::{clamp_concurrency, ExecutorConfig, TruncationConfig};
use crate::provider::{error_reason_code, GenerationRequest, ModelProvider, ProviderError};

use super::event_bus::{RunEventBus, RunEventNotice};
use super::models::{GenerationRun, RunStatus};
use super::repository::RunRepository;
use super::truncate::truncate_event_chunk;

#[derive(Debug)]
struct QueuedRun {
    run_id: String,
    chat_id: String,
}

#[derive(Default)]
struct ExecutorState {
    queue: VecDeque<QueuedRun>,
    /// Run ids currently sitting in `queue`.
    queued_run_ids: HashSet<String>,
    /// Chats with an execution in flight.
    active_chats: HashSet<String>,
    running: usize,
    draining: bool,
    drain_requested: bool,
}

struct ExecutorInner {
    runs: RunRepository,
    chats: ChatRepository,
    bus: RunEventBus,
    provider: Arc<dyn ModelProvider>,
    system_prompt: String,
    max_concurrency: usize,
    truncation: TruncationConfig,
    state: Mutex<ExecutorState>,
    /// One token per in-flight execution; presence doubles as the
    /// "currently executing" marker for enqueue dedup.
    cancel_tokens: DashMap<String, CancellationToken>,
}

/// Schedules and executes generation runs. Cheap to clone.
#[derive(Clone)]
pub struct RunExecutor {
    inner: Arc<ExecutorInner>,
}

impl RunExecutor {
    pub fn new(
        runs: RunRepository,
        chats: ChatRepository,
        bus: RunEventBus,
        provider: Arc<dyn ModelProvider>,
        config: &ExecutorConfig,
        system_prompt: String,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                runs,
                chats,
                bus,
                provider,
                system_prompt,
                max_concurrency: clamp_concurrency(config.max_concurrency),
                truncation: config.truncation.clone(),
                state: Mutex::new(ExecutorState::default()),
                cancel_tokens: DashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ExecutorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a run for execution. Idempotent: a run already queued or
    /// executing is not queued again.
    pub fn enqueue(&self, run_id: &str, chat_id: &str) {
        {
            let mut state = self.state();
            if state.queued_run_ids.contains(run_id)
                || self.inner.cancel_tokens.contains_key(run_id)
            {
                debug!(run_id, "run already queued or executing");
                return;
            }
            state.queued_run_ids.insert(run_id.to_string());
            state.queue.push_back(QueuedRun {
                run_id: run_id.to_string(),
                chat_id: chat_id.to_string(),
            });
        }
        self.drain();
    }

    /// Signal cancellation for an executing run. A run that is not
    /// currently executing is untouched; callers cancel queued runs by
    /// writing their status before they are admitted.
    pub fn cancel(&self, run_id: &str) {
        if let Some(token) = self.inner.cancel_tokens.get(run_id) {
            token.cancel();
        }
    }

    /// Admit queued runs until the concurrency limit is hit or every
    /// remaining item's chat is busy.
    ///
    /// At most one drain pass runs at a time; a drain requested while one is
    /// in progress is folded into an extra pass at the end, so a completion
    /// landing mid-pass is never lost.
    fn drain(&self) {
        {
            let mut state = self.state();
            if state.draining {
                state.drain_requested = true;
                return;
            }
            state.draining = true;
        }

        loop {
            let next = {
                let mut state = self.state();
                if state.running >= self.inner.max_concurrency {
                    None
                } else {
                    let idx = state
                        .queue
                        .iter()
                        .position(|item| !state.active_chats.contains(&item.chat_id));
                    idx.and_then(|idx| state.queue.remove(idx)).map(|item| {
                        state.running += 1;
                        state.active_chats.insert(item.chat_id.clone());
                        state.queued_run_ids.remove(&item.run_id);
                        let token = CancellationToken::new();
                        self.inner
                            .cancel_tokens
                            .insert(item.run_id.clone(), token.clone());
                        (item, token)
                    })
                }
            };

            match next {
                Some((item, token)) => {
                    let executor = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = executor.execute(&item.run_id, token).await {
                            error!(run_id = %item.run_id, error = %e, "run execution failed");
                            let _ = executor
                                .inner
                                .runs
                                .set_status(&item.run_id, RunStatus::Failed, Some("run.failed"))
                                .await;
                        }
                        executor.inner.cancel_tokens.remove(&item.run_id);
                        {
                            let mut state = executor.state();
                            state.running -= 1;
                            state.active_chats.remove(&item.chat_id);
                        }
                        executor.drain();
                    });
                }
                None => {
                    let mut state = self.state();
                    if state.drain_requested {
                        state.drain_requested = false;
                        drop(state);
                        continue;
                    }
                    state.draining = false;
                    break;
                }
            }
        }
    }

    async fn execute(&self, run_id: &str, token: CancellationToken) -> Result<()> {
        let Some(run) = self.inner.runs.get(run_id).await? else {
            warn!(run_id, "queued run vanished before execution");
            return Ok(());
        };
        // Anything past queued means another path already claimed the run
        // (e.g. canceled while waiting for a slot).
        if run.status() != RunStatus::Queued {
            debug!(run_id, status = %run.status, "skipping run no longer queued");
            return Ok(());
        }

        let messages: Value =
            serde_json::from_str(&run.messages).context("parsing run message snapshot")?;

        if !self.inner.provider.has_api_key(&run.model_id) {
            return self.fail_before_output(&run, "models.missing_api_key").await;
        }
        if snapshot_has_images(&messages) && !self.inner.provider.supports_vision(&run.model_id) {
            return self
                .fail_before_output(&run, "models.vision_not_supported")
                .await;
        }

        self.inner
            .runs
            .set_status(run_id, RunStatus::Running, None)
            .await?;
        info!(run_id, chat_id = %run.chat_id, model_id = %run.model_id, "run started");

        let request = GenerationRequest {
            model_id: run.model_id.clone(),
            system_prompt: self.inner.system_prompt.clone(),
            messages,
        };
        let mut stream = match self.inner.provider.stream_generation(request).await {
            Ok(stream) => stream,
            Err(e) => return self.fail_streaming(&run, &e, &[]).await,
        };

        let mut parts: Vec<MessagePart> = Vec::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    // The cancel endpoint owns the finish event and the
                    // partial-parts persistence; dropping the stream aborts
                    // the provider call.
                    self.inner
                        .runs
                        .set_status(run_id, RunStatus::Canceled, None)
                        .await?;
                    info!(run_id, "run canceled");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        self.publish_event(run_id, &event).await?;
                        reduce_event(&mut parts, &event);
                    }
                    Some(Err(e)) => return self.fail_streaming(&run, &e, &parts).await,
                    None => break,
                }
            }
        }

        self.inner
            .runs
            .set_status(run_id, RunStatus::Succeeded, None)
            .await?;
        self.persist_parts(&run, &parts).await?;
        self.inner
            .chats
            .set_unread(&run.chat_id, &run.user_id, true)
            .await?;
        info!(run_id, parts = parts.len(), "run succeeded");
        Ok(())
    }

    /// Serialize, bound, store, and fan out one event.
    ///
    /// Also used by the cancel endpoint to publish its finish marker.
    pub async fn publish_event(&self, run_id: &str, event: &StreamEvent) -> Result<i64> {
        let original = serde_json::to_string(event).context("serializing run event")?;
        let parsed = serde_json::to_value(event).context("serializing run event")?;
        let chunk = truncate_event_chunk(&self.inner.truncation, &parsed, &original);
        let stored = self.inner.runs.append_event(run_id, &chunk).await?;
        self.inner.bus.emit(RunEventNotice {
            run_id: run_id.to_string(),
            seq: stored.seq,
            chunk,
        });
        Ok(stored.seq)
    }

    /// Fail a run that produced no output yet: synthesize the terminal
    /// `error`/`finish` pair so any attached stream closes cleanly.
    async fn fail_before_output(&self, run: &GenerationRun, code: &str) -> Result<()> {
        warn!(run_id = %run.id, code, "run rejected before generation");
        self.publish_event(
            &run.id,
            &StreamEvent::Error {
                error_text: code.to_string(),
            },
        )
        .await?;
        self.publish_event(&run.id, &StreamEvent::Finish).await?;
        self.inner
            .runs
            .set_status(&run.id, RunStatus::Failed, Some(code))
            .await?;
        Ok(())
    }

    async fn fail_streaming(
        &self,
        run: &GenerationRun,
        err: &ProviderError,
        parts: &[MessagePart],
    ) -> Result<()> {
        let code = error_reason_code(err);
        warn!(run_id = %run.id, error = %err, code, "provider stream failed");
        self.publish_event(
            &run.id,
            &StreamEvent::Error {
                error_text: code.to_string(),
            },
        )
        .await?;
        self.publish_event(&run.id, &StreamEvent::Finish).await?;
        self.inner
            .runs
            .set_status(&run.id, RunStatus::Failed, Some(code))
            .await?;
        if !parts.is_empty() {
            self.persist_parts(run, parts).await?;
        }
        Ok(())
    }

    async fn persist_parts(&self, run: &GenerationRun, parts: &[MessagePart]) -> Result<()> {
        let parts = serde_json::to_value(parts).context("serializing assistant parts")?;
        self.inner
            .chats
            .update_message_parts(&run.assistant_message_id, &parts)
            .await
    }
}

/// Whether the prompt snapshot carries image content.
pub(crate) fn snapshot_has_images(messages: &Value) -> bool {
    let Some(messages) = messages.as_array() else {
        return false;
    };
    messages.iter().any(|message| {
        let image_part = message
            .get("parts")
            .and_then(Value::as_array)
            .is_some_and(|parts| {
                parts.iter().any(|part| {
                    match part.get("type").and_then(Value::as_str) {
                        Some("image") => true,
                        Some("file") => part
                            .get("mediaType")
                            .and_then(Value::as_str)
                            .is_some_and(|t| t.starts_with("image/")),
                        _ => false,
                    }
                })
            });
        let image_attachment = message
            .get("attachments")
            .and_then(Value::as_array)
            .is_some_and(|attachments| {
                attachments.iter().any(|a| {
                    a.get("contentType")
                        .and_then(Value::as_str)
                        .is_some_and(|t| t.starts_with("image/"))
                })
            });
        image_part || image_attachment
    })
}
