//! Run lifecycle controller.
//!
//! Drives a submission from prompt to final parts while treating the
//! connection as disposable: the server keeps generating whether or not we
//! are attached, so every failure path here is about re-attaching, never
//! about restarting generation. Progress reaches the embedding application
//! through the [`RunObserver`] callbacks.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_protocol::{reduce_event, MessagePart, StreamEvent};

use crate::cursor::CursorStore;
use crate::sse::{FrameParser, SseFrame};

/// Where the controller is in a run's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Ready,
    Submitted,
    Streaming,
    /// Attached or re-attaching to a run that was already in flight.
    Resuming,
}

/// Callbacks for run progress. Implementations must be cheap; they are
/// invoked inline from the stream reader.
pub trait RunObserver: Send + Sync {
    /// The user/assistant message pair was accepted by the server. Called
    /// exactly once per submission, never again on reconnects.
    fn committed(&self, run_id: &str, assistant_message_id: &str) {
        let _ = (run_id, assistant_message_id);
    }

    /// The assistant parts changed. Throttled to at most one call per flush
    /// interval, with boundary events always flushed.
    fn parts_updated(&self, parts: &[MessagePart]) {
        let _ = parts;
    }

    fn state_changed(&self, state: ControllerState) {
        let _ = state;
    }

    fn finished(&self) {}

    /// A terminal or stream-level error, identified by its reason code.
    fn errored(&self, code: &str) {
        let _ = code;
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: String,
    /// Applies to establishing connections only; a healthy stream may stay
    /// silent between events indefinitely (heartbeats keep it alive).
    pub connect_timeout: Duration,
    pub retry_base_delay: Duration,
    pub max_attempts: u32,
    pub resume_after_submit_failure: Duration,
    pub resume_after_stream_failure: Duration,
    pub flush_interval: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            connect_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_millis(500),
            max_attempts: 3,
            resume_after_submit_failure: Duration::from_millis(750),
            resume_after_stream_failure: Duration::from_millis(1500),
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Request body for starting a run. Mirrors the server's `POST /api/runs`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Chat id; created server-side on the first message.
    pub id: String,
    pub model_id: String,
    pub messages: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_message_id: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub personalization: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub run_id: String,
    pub assistant_message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveRunInfo {
    run_id: String,
}

#[derive(Debug, Deserialize)]
struct ActiveRunResponse {
    run: Option<ActiveRunInfo>,
}

struct ActiveRun {
    run_id: String,
    abort: CancellationToken,
}

enum StreamEnd {
    Terminal,
    Aborted,
}

pub struct RunController {
    client: reqwest::Client,
    config: ClientConfig,
    observer: Arc<dyn RunObserver>,
    cursors: Arc<Mutex<CursorStore>>,
    state: Mutex<ControllerState>,
    current: Mutex<Option<ActiveRun>>,
}

impl RunController {
    pub fn new(
        config: ClientConfig,
        observer: Arc<dyn RunObserver>,
        cursors: CursorStore,
    ) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Arc::new(Self {
            client,
            config,
            observer,
            cursors: Arc::new(Mutex::new(cursors)),
            state: Mutex::new(ControllerState::Ready),
            current: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> ControllerState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ControllerState) {
        *lock(&self.state) = state;
        self.observer.state_changed(state);
    }

    /// Submit a prompt and attach to the resulting run.
    ///
    /// A transport failure does not mean the run was not created: the
    /// request may have reached the server. One deferred check against the
    /// active-run endpoint recovers that case.
    pub async fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<SubmitResponse> {
        self.set_state(ControllerState::Submitted);
        let url = format!("{}/api/runs", self.config.base_url);
        let sent = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&request)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                warn!(chat_id = %request.id, error = %e, "run submission failed, scheduling a resume check");
                self.schedule_resume_check(
                    request.id.clone(),
                    self.config.resume_after_submit_failure,
                );
                self.set_state(ControllerState::Ready);
                return Err(e).context("submitting run");
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let code = rejection_code(&body);
            self.observer.errored(&code);
            self.set_state(ControllerState::Ready);
            anyhow::bail!("run submission rejected with status {}: {}", status, body);
        }

        let accepted: SubmitResponse = response
            .json()
            .await
            .context("decoding run submission response")?;
        self.observer
            .committed(&accepted.run_id, &accepted.assistant_message_id);
        self.attach(accepted.run_id.clone(), false);
        Ok(accepted)
    }

    /// Look up the chat's active run and attach to it if one exists.
    /// The resume-after-reload entry point.
    pub async fn resume_chat(self: &Arc<Self>, chat_id: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/api/runs/active?chatId={}",
            self.config.base_url, chat_id
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .context("querying active run")?;
        if !response.status().is_success() {
            anyhow::bail!("active run lookup returned status {}", response.status());
        }
        let body: ActiveRunResponse = response
            .json()
            .await
            .context("decoding active run response")?;
        match body.run {
            Some(run) => {
                self.attach(run.run_id.clone(), true);
                Ok(Some(run.run_id))
            }
            None => Ok(None),
        }
    }

    /// Attach to a run's event stream in the background. Any run still
    /// attached is aborted first so only one reader feeds the observer.
    pub fn attach(self: &Arc<Self>, run_id: String, resuming: bool) {
        let abort = CancellationToken::new();
        {
            let mut current = lock(&self.current);
            if let Some(previous) = current.take() {
                previous.abort.cancel();
            }
            *current = Some(ActiveRun {
                run_id: run_id.clone(),
                abort: abort.clone(),
            });
        }
        self.set_state(if resuming {
            ControllerState::Resuming
        } else {
            ControllerState::Streaming
        });
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.consume(run_id, abort).await;
        });
    }

    /// Abort the local read and request server-side cancellation without
    /// waiting for the acknowledgment. The controller is immediately ready
    /// for the next submission.
    pub fn stop(&self) {
        let Some(active) = lock(&self.current).take() else {
            return;
        };
        active.abort.cancel();
        let client = self.client.clone();
        let token = self.config.token.clone();
        let url = format!(
            "{}/api/runs/{}/cancel",
            self.config.base_url, active.run_id
        );
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).bearer_auth(&token).send().await {
                debug!(error = %e, "cancel request failed");
            }
        });
        self.set_state(ControllerState::Ready);
    }

    fn schedule_resume_check(self: &Arc<Self>, chat_id: String, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            sleep(delay).await;
            if lock(&this.current).is_some() {
                return;
            }
            match this.resume_chat(&chat_id).await {
                Ok(Some(run_id)) => debug!(run_id, "recovered run after failed submission"),
                Ok(None) => debug!(chat_id, "no active run to recover"),
                Err(e) => debug!(chat_id, error = %e, "resume check failed"),
            }
        });
    }

    async fn consume(self: Arc<Self>, run_id: String, abort: CancellationToken) {
        let mut parts: Vec<MessagePart> = Vec::new();
        let mut cursor = lock(&self.cursors).get(&run_id).unwrap_or(0);
        let mut attempt: u32 = 0;
        let mut deferred_resume_used = false;

        loop {
            let end = self
                .stream_once(&run_id, &mut cursor, &mut parts, &abort)
                .await;
            match end {
                Ok(StreamEnd::Terminal) => {
                    if lock(&self.cursors).clear(&run_id) {
                        let cursors = Arc::clone(&self.cursors);
                        let flushed =
                            tokio::task::spawn_blocking(move || lock(&cursors).flush()).await;
                        match flushed {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!(run_id, error = %e, "clearing cursor failed"),
                            Err(e) => debug!(run_id, error = %e, "clearing cursor failed"),
                        }
                    }
                    self.detach(&run_id);
                    self.set_state(ControllerState::Ready);
                    return;
                }
                Ok(StreamEnd::Aborted) => return,
                Err(e) => {
                    if abort.is_cancelled() {
                        return;
                    }
                    attempt += 1;
                    if attempt < self.config.max_attempts {
                        let delay = self.config.retry_base_delay * 2u32.pow(attempt);
                        debug!(run_id, attempt, error = %e, "stream dropped, retrying");
                        self.set_state(ControllerState::Resuming);
                        tokio::select! {
                            _ = abort.cancelled() => return,
                            _ = sleep(delay) => {}
                        }
                        continue;
                    }
                    // One last deferred attempt: the run may still be
                    // generating and a later attach costs nothing.
                    if !deferred_resume_used {
                        deferred_resume_used = true;
                        attempt = 0;
                        warn!(run_id, error = %e, "retries exhausted, deferring one more resume");
                        self.set_state(ControllerState::Resuming);
                        tokio::select! {
                            _ = abort.cancelled() => return,
                            _ = sleep(self.config.resume_after_stream_failure) => {}
                        }
                        continue;
                    }
                    warn!(run_id, error = %e, "giving up on run stream");
                    self.observer.errored("run.stream_failed");
                    self.detach(&run_id);
                    self.set_state(ControllerState::Ready);
                    return;
                }
            }
        }
    }

    /// Persist the cursor file on the blocking pool; the stream reader never
    /// does file IO inline. The flush serializes the entries current at
    /// write time, so late tasks cannot resurrect stale state.
    fn flush_cursors(&self) {
        let cursors = Arc::clone(&self.cursors);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = lock(&cursors).flush() {
                debug!(error = %e, "cursor persist failed");
            }
        });
    }

    fn detach(&self, run_id: &str) {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|a| a.run_id == run_id) {
            *current = None;
        }
    }

    async fn stream_once(
        &self,
        run_id: &str,
        cursor: &mut i64,
        parts: &mut Vec<MessagePart>,
        abort: &CancellationToken,
    ) -> Result<StreamEnd> {
        let url = format!(
            "{}/api/runs/{}/stream?cursor={}",
            self.config.base_url, run_id, cursor
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .context("connecting to run stream")?;
        let status = response.status();
        if status.is_client_error() {
            // The run is gone; there is nothing left to resume.
            self.observer.errored("run.failed");
            return Ok(StreamEnd::Terminal);
        }
        if !status.is_success() {
            anyhow::bail!("run stream returned status {}", status);
        }

        self.set_state(ControllerState::Streaming);
        let mut body = response.bytes_stream();
        let mut parser = FrameParser::new();
        let mut last_flush = Instant::now();
        let mut dirty = false;

        loop {
            let chunk = tokio::select! {
                _ = abort.cancelled() => return Ok(StreamEnd::Aborted),
                chunk = body.next() => chunk,
            };
            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    if dirty {
                        self.observer.parts_updated(parts);
                    }
                    return Err(e).context("reading run stream");
                }
                None => {
                    if dirty {
                        self.observer.parts_updated(parts);
                    }
                    anyhow::bail!("run stream ended without a terminal event");
                }
            };

            for frame in parser.feed(&bytes) {
                let SseFrame::Event { id, data } = frame else {
                    continue;
                };
                if let Some(id) = id {
                    *cursor = id;
                    if lock(&self.cursors).record(run_id, id) {
                        self.flush_cursors();
                    }
                }
                let Ok(event) = serde_json::from_str::<StreamEvent>(&data) else {
                    debug!(run_id, "skipping unparseable stream event");
                    continue;
                };
                reduce_event(parts, &event);
                dirty = true;

                if let Some(code) = event.error_text() {
                    self.observer.errored(code);
                }
                if is_flush_boundary(&event)
                    || last_flush.elapsed() >= self.config.flush_interval
                {
                    self.observer.parts_updated(parts);
                    dirty = false;
                    last_flush = Instant::now();
                }
                if matches!(event, StreamEvent::Finish) {
                    self.observer.finished();
                    return Ok(StreamEnd::Terminal);
                }
            }
        }
    }
}

/// Boundary events always flush; deltas between them are throttled.
fn is_flush_boundary(event: &StreamEvent) -> bool {
    matches!(
        event,
        StreamEvent::TextStart
            | StreamEvent::TextEnd { .. }
            | StreamEvent::ReasoningStart
            | StreamEvent::ToolInputAvailable { .. }
            | StreamEvent::ToolOutputAvailable { .. }
            | StreamEvent::Error { .. }
            | StreamEvent::Finish
    )
}

fn rejection_code(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error_code")?.as_str().map(str::to_string))
        .unwrap_or_else(|| "run.failed".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_code_prefers_the_server_reason() {
        assert_eq!(
            rejection_code(r#"{"error":"x","error_code":"models.missing_api_key"}"#),
            "models.missing_api_key"
        );
        assert_eq!(rejection_code("not json"), "run.failed");
    }

    #[test]
    fn boundary_events() {
        assert!(is_flush_boundary(&StreamEvent::TextStart));
        assert!(is_flush_boundary(&StreamEvent::Finish));
        assert!(!is_flush_boundary(&StreamEvent::TextDelta {
            delta: "x".into()
        }));
    }
}
