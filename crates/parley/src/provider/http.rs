//! OpenAI-compatible streaming provider.
//!
//! Speaks the `chat/completions` SSE dialect: `data: {json}` lines separated
//! by blank lines, terminated by `data: [DONE]`. Upstream deltas are
//! normalized into the run event alphabet here so the executor never sees
//! provider-specific shapes.

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use parley_protocol::{StreamEvent, StreamingUtf8Decoder};

use crate::config::ProviderConfig;

use super::{GenerationRequest, ModelProvider, ProviderError, ProviderStream};

pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Flatten a snapshot message into `{role, content}` text form.
    fn to_wire_message(message: &Value) -> Option<Value> {
        let role = message.get("role")?.as_str()?;
        let content = match message.get("content").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => {
                // Fall back to concatenating text parts.
                let parts = message.get("parts")?.as_array()?;
                parts
                    .iter()
                    .filter_map(|p| {
                        if p.get("type")?.as_str()? == "text" {
                            p.get("text")?.as_str().map(str::to_string)
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("")
            }
        };
        Some(json!({ "role": role, "content": content }))
    }
}

#[async_trait::async_trait]
impl ModelProvider for HttpProvider {
    fn has_api_key(&self, _model_id: &str) -> bool {
        self.config
            .api_key
            .as_deref()
            .is_some_and(|k| !k.is_empty())
    }

    fn supports_vision(&self, model_id: &str) -> bool {
        self.config.vision_models.iter().any(|m| m == model_id)
    }

    async fn stream_generation(
        &self,
        request: GenerationRequest,
    ) -> Result<ProviderStream, ProviderError> {
        let api_key = self
            .config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::MissingApiKey(request.model_id.clone()))?;

        let mut wire_messages = vec![json!({
            "role": "system",
            "content": request.system_prompt,
        })];
        if let Some(snapshot) = request.messages.as_array() {
            wire_messages.extend(snapshot.iter().filter_map(Self::to_wire_message));
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": request.model_id,
                "messages": wire_messages,
                "stream": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream { status, body });
        }

        let (tx, rx) = mpsc::channel::<Result<StreamEvent, ProviderError>>(64);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = StreamingUtf8Decoder::new();
            let mut buffer = String::new();
            let mut text_open = false;
            let mut finished = false;

            'read: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Request(e))).await;
                        return;
                    }
                };
                // Deltas can split a multi-byte character across reads;
                // decode only completed codepoints.
                buffer.push_str(&decoder.decode(&chunk));

                while let Some(boundary) = buffer.find("\n\n") {
                    let frame = buffer[..boundary].to_string();
                    buffer.drain(..boundary + 2);

                    for line in frame.lines() {
                        let line = line.trim();
                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let data = data.trim();
                        if data == "[DONE]" {
                            finished = true;
                            break 'read;
                        }
                        let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                            debug!("skipping malformed provider frame");
                            continue;
                        };
                        let delta = &parsed["choices"][0]["delta"];

                        if let Some(reasoning) =
                            delta.get("reasoning").and_then(Value::as_str)
                        {
                            if !reasoning.is_empty() {
                                let ev = StreamEvent::ReasoningDelta {
                                    delta: reasoning.to_string(),
                                };
                                if tx.send(Ok(ev)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        if let Some(content) = delta.get("content").and_then(Value::as_str) {
                            if !content.is_empty() {
                                if !text_open {
                                    text_open = true;
                                    if tx.send(Ok(StreamEvent::TextStart)).await.is_err() {
                                        return;
                                    }
                                }
                                let ev = StreamEvent::TextDelta {
                                    delta: content.to_string(),
                                };
                                if tx.send(Ok(ev)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }

            if text_open && tx.send(Ok(StreamEvent::TextEnd { text: None })).await.is_err() {
                return;
            }
            if finished {
                let _ = tx.send(Ok(StreamEvent::Finish)).await;
            } else {
                let _ = tx
                    .send(Err(ProviderError::Stream(
                        "provider stream ended without [DONE]".to_string(),
                    )))
                    .await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_part_based_messages() {
        let msg = json!({
            "role": "user",
            "parts": [
                {"type": "text", "text": "hello "},
                {"type": "image", "url": "x"},
                {"type": "text", "text": "world"}
            ]
        });
        let wire = HttpProvider::to_wire_message(&msg).unwrap();
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"], "hello world");
    }

    #[test]
    fn missing_key_is_reported() {
        let provider = HttpProvider::new(ProviderConfig::default());
        assert!(!provider.has_api_key("any-model"));
    }
}
