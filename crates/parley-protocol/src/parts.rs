//! Pure event-to-parts reducer.
//!
//! Folds a run's ordered event stream into the message parts a client
//! renders: text and reasoning accumulate by concatenation, tool invocations
//! move through call-then-result transitions. The reducer is deterministic
//! and timing-free; flush scheduling lives with the caller.
//!
//! Both the server (finalizing an assistant message, reconstructing parts
//! after a cancel) and the client (live rendering) fold with this function,
//! so a replayed stream always reconstructs the same parts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::StreamEvent;

/// Lifecycle of a tool invocation part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolInvocationState {
    /// Arguments assembled (or still assembling), no result yet.
    Call,
    /// The tool produced its output.
    Result,
}

/// One renderable part of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolInvocation {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        /// Argument text while streaming, then the parsed input value.
        args: Value,
        state: ToolInvocationState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
}

/// Applies one event to the accumulated parts.
///
/// Terminal markers and unknown events leave the parts untouched. Deltas that
/// arrive without their `*-start` event (possible after a mid-part resume)
/// open a fresh part rather than being dropped.
pub fn reduce_event(parts: &mut Vec<MessagePart>, event: &StreamEvent) {
    match event {
        StreamEvent::TextStart => {
            parts.push(MessagePart::Text { text: String::new() });
        }
        StreamEvent::TextDelta { delta } => {
            if delta.is_empty() {
                return;
            }
            match parts.last_mut() {
                Some(MessagePart::Text { text }) => text.push_str(delta),
                _ => parts.push(MessagePart::Text { text: delta.clone() }),
            }
        }
        StreamEvent::TextEnd { text: final_text } => {
            if let Some(final_text) = final_text {
                if !final_text.is_empty() {
                    if let Some(MessagePart::Text { text }) = parts.last_mut() {
                        *text = final_text.clone();
                    }
                }
            }
        }
        StreamEvent::ReasoningStart => {
            if !matches!(parts.last(), Some(MessagePart::Reasoning { .. })) {
                parts.push(MessagePart::Reasoning { text: String::new() });
            }
        }
        StreamEvent::ReasoningDelta { delta } => {
            if delta.is_empty() {
                return;
            }
            match parts.last_mut() {
                Some(MessagePart::Reasoning { text }) => text.push_str(delta),
                _ => parts.push(MessagePart::Reasoning { text: delta.clone() }),
            }
        }
        StreamEvent::ToolInputStart {
            tool_call_id,
            tool_name,
        } => {
            parts.push(MessagePart::ToolInvocation {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                args: Value::String(String::new()),
                state: ToolInvocationState::Call,
                result: None,
            });
        }
        StreamEvent::ToolInputDelta {
            tool_call_id,
            input_text_delta,
        } => {
            if input_text_delta.is_empty() {
                return;
            }
            if let Some(MessagePart::ToolInvocation { args, .. }) =
                find_invocation(parts, tool_call_id)
            {
                match args {
                    Value::String(s) => s.push_str(input_text_delta),
                    _ => *args = Value::String(input_text_delta.clone()),
                }
            }
        }
        StreamEvent::ToolInputAvailable {
            tool_call_id,
            input,
        } => {
            if let Some(MessagePart::ToolInvocation { args, .. }) =
                find_invocation(parts, tool_call_id)
            {
                *args = input.clone();
            }
        }
        StreamEvent::ToolOutputAvailable {
            tool_call_id,
            output,
        } => {
            if let Some(MessagePart::ToolInvocation { state, result, .. }) =
                find_invocation(parts, tool_call_id)
            {
                *state = ToolInvocationState::Result;
                *result = Some(output.clone());
            }
        }
        StreamEvent::Error { .. } | StreamEvent::Finish | StreamEvent::Unknown => {}
    }
}

fn find_invocation<'a>(
    parts: &'a mut [MessagePart],
    id: &str,
) -> Option<&'a mut MessagePart> {
    parts.iter_mut().find(|p| {
        matches!(p, MessagePart::ToolInvocation { tool_call_id, .. } if tool_call_id == id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fold(events: &[StreamEvent]) -> Vec<MessagePart> {
        let mut parts = Vec::new();
        for ev in events {
            reduce_event(&mut parts, ev);
        }
        parts
    }

    #[test]
    fn accumulates_text_deltas() {
        let parts = fold(&[
            StreamEvent::TextStart,
            StreamEvent::TextDelta { delta: "Hel".into() },
            StreamEvent::TextDelta { delta: "lo".into() },
            StreamEvent::TextEnd { text: None },
        ]);
        assert_eq!(parts, vec![MessagePart::Text { text: "Hello".into() }]);
    }

    #[test]
    fn text_end_final_content_wins() {
        let parts = fold(&[
            StreamEvent::TextStart,
            StreamEvent::TextDelta { delta: "draft".into() },
            StreamEvent::TextEnd {
                text: Some("final".into()),
            },
        ]);
        assert_eq!(parts, vec![MessagePart::Text { text: "final".into() }]);
    }

    #[test]
    fn delta_without_start_opens_a_part() {
        // A resume from a mid-part cursor sees deltas with no preceding start.
        let parts = fold(&[StreamEvent::TextDelta { delta: "tail".into() }]);
        assert_eq!(parts, vec![MessagePart::Text { text: "tail".into() }]);
    }

    #[test]
    fn reasoning_then_text_are_separate_parts() {
        let parts = fold(&[
            StreamEvent::ReasoningStart,
            StreamEvent::ReasoningDelta { delta: "think".into() },
            StreamEvent::TextStart,
            StreamEvent::TextDelta { delta: "say".into() },
        ]);
        assert_eq!(
            parts,
            vec![
                MessagePart::Reasoning { text: "think".into() },
                MessagePart::Text { text: "say".into() },
            ]
        );
    }

    #[test]
    fn tool_call_then_result_transition() {
        let parts = fold(&[
            StreamEvent::ToolInputStart {
                tool_call_id: "c1".into(),
                tool_name: "calculator".into(),
            },
            StreamEvent::ToolInputDelta {
                tool_call_id: "c1".into(),
                input_text_delta: "{\"a\":1".into(),
            },
            StreamEvent::ToolInputDelta {
                tool_call_id: "c1".into(),
                input_text_delta: "}".into(),
            },
            StreamEvent::ToolInputAvailable {
                tool_call_id: "c1".into(),
                input: json!({"a": 1}),
            },
            StreamEvent::ToolOutputAvailable {
                tool_call_id: "c1".into(),
                output: json!({"answer": 2}),
            },
        ]);
        assert_eq!(
            parts,
            vec![MessagePart::ToolInvocation {
                tool_call_id: "c1".into(),
                tool_name: "calculator".into(),
                args: json!({"a": 1}),
                state: ToolInvocationState::Result,
                result: Some(json!({"answer": 2})),
            }]
        );
    }

    #[test]
    fn terminal_and_unknown_events_are_inert() {
        let parts = fold(&[
            StreamEvent::TextStart,
            StreamEvent::TextDelta { delta: "x".into() },
            StreamEvent::Unknown,
            StreamEvent::Error {
                error_text: "run.failed".into(),
            },
            StreamEvent::Finish,
        ]);
        assert_eq!(parts, vec![MessagePart::Text { text: "x".into() }]);
    }
}
