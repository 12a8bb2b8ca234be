//! Client-side controller for resumable Parley generation runs.
//!
//! The server generates independently of any connection; this crate owns the
//! other half of that contract: submitting runs, consuming the SSE event
//! stream, persisting resume cursors across restarts, and reconnecting after
//! transport failures without ever restarting generation.

pub mod controller;
pub mod cursor;
pub mod sse;

pub use controller::{
    ClientConfig, ControllerState, RunController, RunObserver, SubmitRequest, SubmitResponse,
};
pub use cursor::CursorStore;
pub use sse::{FrameParser, SseFrame};
