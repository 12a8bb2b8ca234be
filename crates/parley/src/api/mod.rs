//! HTTP API: routes, handlers, shared state, and the stream pump.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
mod stream;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, StreamTimings};
