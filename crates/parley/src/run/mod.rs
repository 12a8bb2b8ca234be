//! Generation runs: models, durable event log, live fan-out, scheduling,
//! and crash recovery.

pub mod event_bus;
pub mod executor;
pub mod models;
pub mod recovery;
pub mod repository;
pub mod truncate;

pub use event_bus::{RunEventBus, RunEventNotice, Subscription};
pub use executor::RunExecutor;
pub use models::{GenerationRun, NewGenerationRun, RunEvent, RunStatus};
pub use recovery::RecoverySweep;
pub use repository::RunRepository;
