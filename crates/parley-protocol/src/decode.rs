//! Incremental UTF-8 decoding for byte streams.
//!
//! Network reads split at arbitrary byte offsets, including inside a
//! multi-byte codepoint. Decoding each chunk on its own would turn a split
//! codepoint into replacement characters, so the decoder holds an incomplete
//! trailing sequence until the next chunk completes it. Genuinely invalid
//! bytes still become U+FFFD.

/// Stateful lossy UTF-8 decoder that is safe across chunk boundaries.
#[derive(Debug, Default)]
pub struct StreamingUtf8Decoder {
    pending: Vec<u8>,
}

impl StreamingUtf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, returning every completed character. A codepoint cut
    /// off at the end of the chunk is buffered and emitted once its
    /// remaining bytes arrive.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending[..valid_up_to]).unwrap_or_default(),
                    );
                    match e.error_len() {
                        Some(invalid) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        None => {
                            // Incomplete trailing codepoint; wait for more
                            // bytes.
                            self.pending.drain(..valid_up_to);
                            return out;
                        }
                    }
                }
            }
        }
    }
}
