//! Canonical run event types.
//!
//! Every chunk appended to a run's event log is a JSON object with a `type`
//! discriminator. Two of the shapes (`finish`, `error`) are control-plane
//! terminal markers: once appended, no further events will ever be appended
//! for that run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One increment of run output, tagged by `type`.
///
/// Unknown discriminators deserialize to [`StreamEvent::Unknown`] so newer
/// servers can add event shapes without breaking older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// A new text part begins.
    TextStart,
    /// Incremental text content.
    TextDelta { delta: String },
    /// The current text part is complete. `text`, when present, is the
    /// authoritative final content and replaces the accumulated deltas.
    TextEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// A new reasoning part begins.
    ReasoningStart,
    /// Incremental reasoning content.
    ReasoningDelta { delta: String },
    /// The model started assembling a tool call.
    ToolInputStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    /// Incremental tool-call argument text.
    ToolInputDelta {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "inputTextDelta")]
        input_text_delta: String,
    },
    /// The tool call's arguments are complete.
    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        input: Value,
    },
    /// The tool produced its result.
    ToolOutputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: Value,
    },
    /// Terminal marker: the run failed. Carries a stable reason code.
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
    /// Terminal marker: no further events will be appended.
    Finish,
    /// Forward-compatibility passthrough for unrecognized `type` values.
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// Whether this event is a control-plane terminal marker.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish | StreamEvent::Error { .. })
    }

    /// The reason code carried by an `error` event, if any.
    pub fn error_text(&self) -> Option<&str> {
        match self {
            StreamEvent::Error { error_text } => Some(error_text),
            _ => None,
        }
    }
}

/// Lenient terminal check on an opaque stored chunk.
///
/// Malformed chunks are not terminal; the stream endpoint and client both
/// skip frames they cannot parse rather than aborting the whole stream.
pub fn is_terminal_chunk(chunk: &str) -> bool {
    #[derive(Deserialize)]
    struct TypeOnly<'a> {
        #[serde(rename = "type")]
        kind: Option<&'a str>,
    }
    match serde_json::from_str::<TypeOnly<'_>>(chunk) {
        Ok(TypeOnly {
            kind: Some("finish"),
        })
        | Ok(TypeOnly {
            kind: Some("error"),
        }) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_events() {
        let ev: StreamEvent = serde_json::from_str(r#"{"type":"text-delta","delta":"hi"}"#).unwrap();
        assert_eq!(ev, StreamEvent::TextDelta { delta: "hi".into() });

        let ev: StreamEvent = serde_json::from_str(
            r#"{"type":"tool-input-start","toolCallId":"c1","toolName":"calc"}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            StreamEvent::ToolInputStart {
                tool_call_id: "c1".into(),
                tool_name: "calc".into()
            }
        );
    }

    #[test]
    fn unknown_type_is_passthrough() {
        let ev: StreamEvent =
            serde_json::from_str(r#"{"type":"source-url","url":"https://x"}"#).unwrap();
        assert_eq!(ev, StreamEvent::Unknown);
        assert!(!ev.is_terminal());
    }

    #[test]
    fn terminal_detection() {
        assert!(is_terminal_chunk(r#"{"type":"finish"}"#));
        assert!(is_terminal_chunk(r#"{"type":"error","errorText":"run.failed"}"#));
        assert!(!is_terminal_chunk(r#"{"type":"text-delta","delta":"x"}"#));
        assert!(!is_terminal_chunk("not json"));
        assert!(!is_terminal_chunk(r#"{"delta":"no type"}"#));
    }

    #[test]
    fn serializes_wire_field_names() {
        let json = serde_json::to_string(&StreamEvent::Error {
            error_text: "models.missing_api_key".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","errorText":"models.missing_api_key"}"#);
    }
}
