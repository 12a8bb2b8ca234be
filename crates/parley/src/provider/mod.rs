//! Model provider interface.
//!
//! The provider is an external collaborator: given a model id, system
//! prompt, and message snapshot, it yields an asynchronous sequence of
//! normalized stream events and supports cooperative abort (drop the
//! stream). Everything else about the upstream service is its business.

mod http;

pub use http::HttpProvider;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use parley_protocol::StreamEvent;

/// Inputs for one generation call, built from a run's immutable snapshot.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model_id: String,
    pub system_prompt: String,
    /// The prompt context exactly as captured at enqueue time.
    pub messages: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no API key configured for model: {0}")]
    MissingApiKey(String),

    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("provider stream error: {0}")]
    Stream(String),
}

/// Map a provider failure to a stable reason code surfaced to clients.
///
/// Best-effort inspection of the error text; anything unrecognized falls
/// back to the generic code.
pub fn error_reason_code(err: &ProviderError) -> &'static str {
    if let ProviderError::MissingApiKey(_) = err {
        return "models.missing_api_key";
    }
    let text = err.to_string().to_lowercase();
    if text.contains("vision") || text.contains("image input") {
        "models.vision_not_supported"
    } else {
        "run.failed"
    }
}

pub type ProviderStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// Streaming language-model generator.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Whether credentials are configured for this model.
    fn has_api_key(&self, model_id: &str) -> bool;

    /// Whether this model accepts image attachments.
    fn supports_vision(&self, model_id: &str) -> bool;

    /// Start a generation and stream normalized output events. The final
    /// event of a successful stream is `finish`. Dropping the stream aborts
    /// the upstream call.
    async fn stream_generation(
        &self,
        request: GenerationRequest,
    ) -> Result<ProviderStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes() {
        assert_eq!(
            error_reason_code(&ProviderError::MissingApiKey("m".into())),
            "models.missing_api_key"
        );
        assert_eq!(
            error_reason_code(&ProviderError::Stream(
                "model does not support vision inputs".into()
            )),
            "models.vision_not_supported"
        );
        assert_eq!(
            error_reason_code(&ProviderError::Upstream {
                status: 500,
                body: "internal".into()
            }),
            "run.failed"
        );
    }
}
