//! Wire-level protocol types for Parley run streams.
//!
//! A generation run produces an ordered log of JSON event chunks. This crate
//! defines the canonical event shapes, terminal-marker detection, and the
//! pure reducer that folds an event sequence into renderable message parts:
//!
//! ```text
//! Client <--[SSE: id/data frames]-- Backend <--[fragments]-- Model provider
//! ```
//!
//! The server stores chunks as opaque strings and only parses them for
//! control-plane decisions (terminal detection, parts reconstruction). The
//! client parses every frame it renders. Both sides share these types so a
//! chunk that round-trips through the event log means the same thing on
//! either end.

pub mod decode;
pub mod events;
pub mod parts;

pub use decode::StreamingUtf8Decoder;
pub use events::{is_terminal_chunk, StreamEvent};
pub use parts::{reduce_event, MessagePart, ToolInvocationState};
