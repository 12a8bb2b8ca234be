//! API handlers.

use std::convert::Infallible;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use parley_protocol::{reduce_event, MessagePart, StreamEvent};

use crate::auth::CurrentUser;
use crate::chat::NewChatMessage;
use crate::run::executor::snapshot_has_images;
use crate::run::{GenerationRun, NewGenerationRun, RunStatus};

use super::error::ApiError;
use super::state::AppState;
use super::stream::pump_run_events;

const CHAT_TITLE_MAX_CHARS: usize = 50;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    /// Chat id; the chat is created on its first message.
    pub id: String,
    pub model_id: String,
    /// Full prompt snapshot. The last entry is the new user message.
    pub messages: Value,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub assistant_message_id: Option<String>,
    #[serde(default)]
    pub personalization: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub run_id: String,
    pub assistant_message_id: String,
}

/// Persist the new user message and an assistant placeholder, create the
/// run, and hand it to the executor. Returns immediately; generation
/// progress flows through the stream endpoint.
pub async fn start_run(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<StartRunRequest>,
) -> Result<Json<StartRunResponse>, ApiError> {
    let messages = body
        .messages
        .as_array()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            ApiError::bad_request("messages must be a non-empty array", "run.invalid_request")
        })?;
    let last = &messages[messages.len() - 1];
    if last.get("role").and_then(Value::as_str) != Some("user") {
        return Err(ApiError::bad_request(
            "last message must be from the user",
            "run.invalid_request",
        ));
    }

    // Model validation up front: a rejected request never creates a run.
    if !state.provider.has_api_key(&body.model_id) {
        return Err(ApiError::bad_request(
            format!("no API key configured for model {}", body.model_id),
            "models.missing_api_key",
        ));
    }
    if snapshot_has_images(&body.messages) && !state.provider.supports_vision(&body.model_id) {
        return Err(ApiError::bad_request(
            format!("model {} does not accept image input", body.model_id),
            "models.vision_not_supported",
        ));
    }

    match state.chats.get_chat(&body.id).await? {
        Some(chat) if chat.user_id != user.id() => {
            return Err(ApiError::Forbidden("chat belongs to another user".into()));
        }
        Some(_) => {}
        None => {
            state
                .chats
                .create_chat(&body.id, user.id(), &derive_title(last))
                .await?;
        }
    }

    // A parent that does not exist in this chat is dropped, not an error:
    // the client's tree may reference a branch from a stale cache.
    let parent_id = match &body.parent_id {
        Some(parent_id) => state
            .chats
            .get_message(parent_id)
            .await?
            .filter(|m| m.chat_id == body.id)
            .map(|m| m.id),
        None => None,
    };

    let user_message_id = last
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let assistant_message_id = body
        .assistant_message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    state
        .chats
        .save_messages(&[
            NewChatMessage {
                id: user_message_id.clone(),
                chat_id: body.id.clone(),
                role: "user".to_string(),
                parts: message_parts(last),
                attachments: last
                    .get("attachments")
                    .cloned()
                    .unwrap_or_else(|| json!([])),
                parent_id,
            },
            NewChatMessage {
                id: assistant_message_id.clone(),
                chat_id: body.id.clone(),
                role: "assistant".to_string(),
                parts: json!([]),
                attachments: json!([]),
                parent_id: Some(user_message_id.clone()),
            },
        ])
        .await?;

    let run = state
        .runs
        .create(NewGenerationRun {
            id: Uuid::new_v4().to_string(),
            chat_id: body.id.clone(),
            user_id: user.id().to_string(),
            model_id: body.model_id.clone(),
            messages: body.messages.clone(),
            user_message_id,
            assistant_message_id: assistant_message_id.clone(),
            personalization: if body.personalization.is_null() {
                json!({})
            } else {
                body.personalization.clone()
            },
        })
        .await?;

    state.executor.enqueue(&run.id, &run.chat_id);
    info!(run_id = %run.id, chat_id = %run.chat_id, "run enqueued");

    Ok(Json(StartRunResponse {
        run_id: run.id,
        assistant_message_id,
    }))
}

/// Cancel a run. Idempotent: canceling a finished run is a 204 no-op.
pub async fn cancel_run(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let run = get_owned_run(&state, &user, &run_id).await?;
    if run.is_terminal() {
        return Ok(StatusCode::NO_CONTENT);
    }

    // Stop the execution, mark the run, and publish the terminal marker so
    // attached streams close. set_status is a no-op if the executor's own
    // cancel branch wins the race.
    state.executor.cancel(&run_id);
    state
        .runs
        .set_status(&run_id, RunStatus::Canceled, None)
        .await?;
    state
        .executor
        .publish_event(&run_id, &StreamEvent::Finish)
        .await?;

    // Reconstruct whatever was generated so partial output survives reload.
    let events = state.runs.events_after(&run_id, 0).await?;
    let mut parts: Vec<MessagePart> = Vec::new();
    for event in &events {
        if let Ok(ev) = serde_json::from_str::<StreamEvent>(&event.chunk) {
            reduce_event(&mut parts, &ev);
        }
    }
    if !parts.is_empty() {
        let parts = serde_json::to_value(&parts).context("serializing canceled run parts")?;
        state
            .chats
            .update_message_parts(&run.assistant_message_id, &parts)
            .await?;
    }

    info!(run_id, "run canceled by user");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub cursor: i64,
}

/// Attach to a run's event feed from the given cursor.
pub async fn stream_run(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(run_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    get_owned_run(&state, &user, &run_id).await?;

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(pump_run_events(
        state.runs.clone(),
        state.bus.clone(),
        state.timings.clone(),
        run_id,
        query.cursor,
        tx,
    ));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        // Proxies must not buffer the stream.
        .header("X-Accel-Buffering", "no")
        .body(body)
        .context("building stream response")
        .map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRunQuery {
    pub chat_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRunInfo {
    pub run_id: String,
    pub status: String,
    pub assistant_message_id: String,
    pub cursor: i64,
}

#[derive(Debug, Serialize)]
pub struct ActiveRunResponse {
    pub run: Option<ActiveRunInfo>,
}

/// The latest active run for a chat, if any. The client's resume-after-
/// reload entry point.
pub async fn active_run(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ActiveRunQuery>,
) -> Result<Json<ActiveRunResponse>, ApiError> {
    let run = state
        .runs
        .active_by_chat(&query.chat_id, user.id())
        .await?
        .map(|run| ActiveRunInfo {
            run_id: run.id,
            status: run.status,
            assistant_message_id: run.assistant_message_id,
            cursor: run.cursor,
        });
    Ok(Json(ActiveRunResponse { run }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveChatsResponse {
    pub chat_ids: Vec<String>,
}

pub async fn active_chats(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<ActiveChatsResponse>, ApiError> {
    let chat_ids = state.runs.active_chat_ids(user.id()).await?;
    Ok(Json(ActiveChatsResponse { chat_ids }))
}

async fn get_owned_run(
    state: &AppState,
    user: &CurrentUser,
    run_id: &str,
) -> Result<GenerationRun, ApiError> {
    let run = state
        .runs
        .get(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run not found: {}", run_id)))?;
    if run.user_id != user.id() {
        return Err(ApiError::Forbidden("run belongs to another user".into()));
    }
    Ok(run)
}

fn message_text(message: &Value) -> String {
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        return text.to_string();
    }
    let Some(parts) = message.get("parts").and_then(Value::as_array) else {
        return String::new();
    };
    parts
        .iter()
        .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn message_parts(message: &Value) -> Value {
    if let Some(parts) = message.get("parts") {
        return parts.clone();
    }
    match message.get("content").and_then(Value::as_str) {
        Some(text) => json!([{ "type": "text", "text": text }]),
        None => json!([]),
    }
}

fn derive_title(message: &Value) -> String {
    let text = message_text(message);
    let title: String = text.trim().chars().take(CHAT_TITLE_MAX_CHARS).collect();
    if title.is_empty() {
        "New Chat".to_string()
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::create_router;
    use crate::api::state::StreamTimings;
    use crate::auth::AuthState;
    use crate::chat::ChatRepository;
    use crate::config::{AuthConfig, ExecutorConfig};
    use crate::db::open_memory_pool;
    use crate::provider::{
        GenerationRequest, ModelProvider, ProviderError, ProviderStream,
    };
    use crate::run::{RunEventBus, RunExecutor, RunRepository};
    use async_trait::async_trait;
    use axum_test::TestServer;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    struct StaticProvider {
        has_key: bool,
    }

    #[async_trait]
    impl ModelProvider for StaticProvider {
        fn has_api_key(&self, _model_id: &str) -> bool {
            self.has_key
        }

        fn supports_vision(&self, _model_id: &str) -> bool {
            false
        }

        async fn stream_generation(
            &self,
            _request: GenerationRequest,
        ) -> Result<ProviderStream, ProviderError> {
            let events = vec![
                StreamEvent::TextStart,
                StreamEvent::TextDelta {
                    delta: "hello".into(),
                },
                StreamEvent::TextEnd { text: None },
                StreamEvent::Finish,
            ];
            Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
        }
    }

    struct TestApp {
        server: TestServer,
        runs: RunRepository,
        chats: ChatRepository,
    }

    async fn test_app(has_key: bool) -> TestApp {
        let pool = open_memory_pool().await.unwrap();
        let runs = RunRepository::new(pool.clone());
        let chats = ChatRepository::new(pool);
        let bus = RunEventBus::new();
        let provider: Arc<dyn ModelProvider> = Arc::new(StaticProvider { has_key });
        let executor = RunExecutor::new(
            runs.clone(),
            chats.clone(),
            bus.clone(),
            Arc::clone(&provider),
            &ExecutorConfig::default(),
            "test prompt".into(),
        );
        let mut tokens = HashMap::new();
        tokens.insert("secret-token".to_string(), "user-1".to_string());

        let state = AppState {
            runs: runs.clone(),
            chats: chats.clone(),
            bus,
            executor,
            provider,
            auth: AuthState::new(AuthConfig { tokens }),
            timings: StreamTimings::default(),
        };
        TestApp {
            server: TestServer::new(create_router(state)).unwrap(),
            runs,
            chats,
        }
    }

    fn run_body(chat_id: &str) -> Value {
        json!({
            "id": chat_id,
            "modelId": "test-model",
            "messages": [
                {"id": "m1", "role": "user", "parts": [{"type": "text", "text": "hello there"}]}
            ]
        })
    }

    async fn wait_terminal(runs: &RunRepository, run_id: &str) {
        for _ in 0..300 {
            if runs.get_required(run_id).await.unwrap().is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} never finished", run_id);
    }

    #[tokio::test]
    async fn start_run_creates_chat_messages_and_run() {
        let app = test_app(true).await;
        let response = app
            .server
            .post("/api/runs")
            .authorization_bearer("secret-token")
            .json(&run_body("c1"))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        let run_id = body["runId"].as_str().unwrap().to_string();
        let assistant_id = body["assistantMessageId"].as_str().unwrap().to_string();

        let chat = app.chats.get_chat("c1").await.unwrap().unwrap();
        assert_eq!(chat.title, "hello there");
        assert_eq!(chat.user_id, "user-1");
        assert!(app.chats.get_message("m1").await.unwrap().is_some());

        wait_terminal(&app.runs, &run_id).await;
        assert_eq!(
            app.runs.get_required(&run_id).await.unwrap().status(),
            RunStatus::Succeeded
        );
        let message = app.chats.get_message(&assistant_id).await.unwrap().unwrap();
        assert!(message.parts.contains("hello"));
    }

    #[tokio::test]
    async fn resubmitting_the_same_message_starts_a_new_run() {
        let app = test_app(true).await;
        let first = app
            .server
            .post("/api/runs")
            .authorization_bearer("secret-token")
            .json(&run_body("c1"))
            .await;
        first.assert_status_ok();
        let first_run = first.json::<Value>()["runId"].as_str().unwrap().to_string();
        wait_terminal(&app.runs, &first_run).await;

        // A client retry reuses the message id "m1"; it must start a fresh
        // run instead of failing on the duplicate insert.
        let second = app
            .server
            .post("/api/runs")
            .authorization_bearer("secret-token")
            .json(&run_body("c1"))
            .await;
        second.assert_status_ok();
        let second_run = second.json::<Value>()["runId"].as_str().unwrap().to_string();
        assert_ne!(first_run, second_run);
        wait_terminal(&app.runs, &second_run).await;
    }

    #[tokio::test]
    async fn start_run_without_api_key_is_rejected() {
        let app = test_app(false).await;
        let response = app
            .server
            .post("/api/runs")
            .authorization_bearer("secret-token")
            .json(&run_body("c1"))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error_code"], "models.missing_api_key");
        // No run was created.
        assert!(app.runs.active_by_chat("c1", "user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_run_on_foreign_chat_is_forbidden() {
        let app = test_app(true).await;
        app.chats
            .create_chat("c1", "someone-else", "Their chat")
            .await
            .unwrap();
        let response = app
            .server
            .post("/api/runs")
            .authorization_bearer("secret-token")
            .json(&run_body("c1"))
            .await;
        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn dangling_parent_is_dropped() {
        let app = test_app(true).await;
        let mut body = run_body("c1");
        body["parentId"] = json!("does-not-exist");
        let response = app
            .server
            .post("/api/runs")
            .authorization_bearer("secret-token")
            .json(&body)
            .await;
        response.assert_status_ok();

        let message = app.chats.get_message("m1").await.unwrap().unwrap();
        assert!(message.parent_id.is_none());
    }

    #[tokio::test]
    async fn requests_without_a_token_are_unauthorized() {
        let app = test_app(true).await;
        let response = app.server.post("/api/runs").json(&run_body("c1")).await;
        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cancel_unknown_run_is_not_found() {
        let app = test_app(true).await;
        let response = app
            .server
            .post("/api/runs/nope/cancel")
            .authorization_bearer("secret-token")
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_finished_runs() {
        let app = test_app(true).await;
        let response = app
            .server
            .post("/api/runs")
            .authorization_bearer("secret-token")
            .json(&run_body("c1"))
            .await;
        let run_id = response.json::<Value>()["runId"]
            .as_str()
            .unwrap()
            .to_string();
        wait_terminal(&app.runs, &run_id).await;

        let response = app
            .server
            .post(&format!("/api/runs/{}/cancel", run_id))
            .authorization_bearer("secret-token")
            .await;
        response.assert_status(StatusCode::NO_CONTENT);
        // Still succeeded, not regressed to canceled.
        assert_eq!(
            app.runs.get_required(&run_id).await.unwrap().status(),
            RunStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn cancel_appends_finish_and_keeps_partial_output() {
        let app = test_app(true).await;
        app.chats.create_chat("c1", "user-1", "Chat").await.unwrap();
        app.chats
            .save_messages(&[NewChatMessage {
                id: "m2".into(),
                chat_id: "c1".into(),
                role: "assistant".into(),
                parts: json!([]),
                attachments: json!([]),
                parent_id: None,
            }])
            .await
            .unwrap();
        // A queued run with some output already logged; never handed to the
        // executor so the cancel below is the only writer.
        app.runs
            .create(NewGenerationRun {
                id: "r1".into(),
                chat_id: "c1".into(),
                user_id: "user-1".into(),
                model_id: "test-model".into(),
                messages: json!([]),
                user_message_id: "m1".into(),
                assistant_message_id: "m2".into(),
                personalization: json!({}),
            })
            .await
            .unwrap();
        app.runs
            .append_event("r1", r#"{"type":"text-start"}"#)
            .await
            .unwrap();
        app.runs
            .append_event("r1", r#"{"type":"text-delta","delta":"partial"}"#)
            .await
            .unwrap();

        let response = app
            .server
            .post("/api/runs/r1/cancel")
            .authorization_bearer("secret-token")
            .await;
        response.assert_status(StatusCode::NO_CONTENT);

        let run = app.runs.get_required("r1").await.unwrap();
        assert_eq!(run.status(), RunStatus::Canceled);

        let events = app.runs.events_after("r1", 0).await.unwrap();
        assert!(events.last().unwrap().chunk.contains(r#""type":"finish""#));

        // The partial text survives on the assistant message.
        let message = app.chats.get_message("m2").await.unwrap().unwrap();
        assert!(message.parts.contains("partial"));
    }

    #[tokio::test]
    async fn active_lookups_report_queued_and_running_runs() {
        let app = test_app(true).await;
        app.chats.create_chat("c1", "user-1", "Chat").await.unwrap();
        app.runs
            .create(NewGenerationRun {
                id: "r1".into(),
                chat_id: "c1".into(),
                user_id: "user-1".into(),
                model_id: "test-model".into(),
                messages: json!([]),
                user_message_id: "m1".into(),
                assistant_message_id: "m2".into(),
                personalization: json!({}),
            })
            .await
            .unwrap();

        let response = app
            .server
            .get("/api/runs/active")
            .add_query_param("chatId", "c1")
            .authorization_bearer("secret-token")
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["run"]["runId"], "r1");
        assert_eq!(body["run"]["status"], "queued");

        let response = app
            .server
            .get("/api/runs/active-chats")
            .authorization_bearer("secret-token")
            .await;
        let body: Value = response.json();
        assert_eq!(body["chatIds"], json!(["c1"]));
    }

    #[tokio::test]
    async fn stream_for_unknown_run_is_not_found() {
        let app = test_app(true).await;
        let response = app
            .server
            .get("/api/runs/nope/stream")
            .authorization_bearer("secret-token")
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[test]
    fn title_derivation() {
        assert_eq!(
            derive_title(&json!({"content": "  hello world  "})),
            "hello world"
        );
        let long = "x".repeat(80);
        assert_eq!(derive_title(&json!({"content": long})).chars().count(), 50);
        assert_eq!(derive_title(&json!({"parts": []})), "New Chat");
        assert_eq!(
            derive_title(&json!({"parts": [{"type": "text", "text": "hi"}]})),
            "hi"
        );
    }
}
