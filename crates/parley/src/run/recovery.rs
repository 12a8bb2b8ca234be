//! Startup crash recovery.
//!
//! In-flight provider calls do not survive a process restart, so any run
//! still `queued` or `running` at startup is an orphan from a previous
//! process. The sweep fails them all before the server accepts traffic;
//! clients attached to those runs learn the outcome through the stream
//! endpoint's terminal synthesis.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::{debug, warn};

use super::repository::RunRepository;

/// One-shot sweep of orphaned runs. `ensure` is a no-op after the first
/// call on a given instance.
#[derive(Debug, Default)]
pub struct RecoverySweep {
    done: AtomicBool,
}

impl RecoverySweep {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    pub async fn ensure(&self, runs: &RunRepository) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let count = runs.fail_all_active("run.failed").await?;
        if count > 0 {
            warn!(count, "failed generation runs orphaned by a previous process");
        } else {
            debug!("no orphaned generation runs");
        }
        Ok(())
    }
}
