//! Incremental server-sent-events frame parser.
//!
//! Bytes arrive in arbitrary chunks; frames are complete only at a blank
//! line. The parser buffers partial frames and partial UTF-8 codepoints
//! across `feed` calls, so callers can hand it raw network reads directly.

use parley_protocol::StreamingUtf8Decoder;

/// One parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// An event frame. `id` is present when the server sent an `id:` line.
    Event { id: Option<i64>, data: String },
    /// A comment frame (e.g. keep-alive pings).
    Comment,
}

#[derive(Debug, Default)]
pub struct FrameParser {
    decoder: StreamingUtf8Decoder,
    buffer: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let decoded = self.decoder.decode(chunk);
        self.buffer.push_str(&decoded);

        let mut frames = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let block = self.buffer[..boundary].to_string();
            self.buffer.drain(..boundary + 2);
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut id = None;
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_comment = false;

    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("id:") {
            id = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line.starts_with(':') {
            saw_comment = true;
        }
    }

    if !data_lines.is_empty() {
        Some(SseFrame::Event {
            id,
            data: data_lines.join("\n"),
        })
    } else if saw_comment {
        Some(SseFrame::Comment)
    } else {
        None
    }
}
