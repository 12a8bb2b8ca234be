//! Durable per-run resume cursors.
//!
//! The last-seen sequence number per run is kept in a small JSON file so a
//! client restart can resume a live run from where it stopped. Writes are
//! rate-limited: streaming deltas arrive far faster than the file needs to
//! be current, and a slightly stale cursor only costs a few replayed frames.
//!
//! `record` and `clear` never touch the file; they report when a persist is
//! due and the caller runs [`CursorStore::flush`] wherever blocking IO is
//! acceptable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

const MIN_WRITE_INTERVAL: Duration = Duration::from_millis(250);
const MAX_UNPERSISTED_RECORDS: u32 = 25;

#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    entries: HashMap<String, i64>,
    last_write: Option<Instant>,
    unpersisted: u32,
    min_write_interval: Duration,
    max_unpersisted: u32,
}

impl CursorStore {
    /// Open the store at `path`, loading any existing cursors.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                debug!(path = %path.display(), error = %e, "discarding unreadable cursor file");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            entries,
            last_write: None,
            unpersisted: 0,
            min_write_interval: MIN_WRITE_INTERVAL,
            max_unpersisted: MAX_UNPERSISTED_RECORDS,
        })
    }

    /// Default location under the platform data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
            .join("run_cursors.json")
    }

    #[cfg(test)]
    fn with_limits(mut self, min_write_interval: Duration, max_unpersisted: u32) -> Self {
        self.min_write_interval = min_write_interval;
        self.max_unpersisted = max_unpersisted;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, run_id: &str) -> Option<i64> {
        self.entries.get(run_id).copied()
    }

    /// Record the latest seen sequence for a run. Returns whether a persist
    /// is due: at most one write per interval unless too many records piled
    /// up since the last flush.
    pub fn record(&mut self, run_id: &str, seq: i64) -> bool {
        self.entries.insert(run_id.to_string(), seq);
        self.unpersisted += 1;

        match self.last_write {
            None => true,
            Some(at) => {
                at.elapsed() >= self.min_write_interval
                    || self.unpersisted >= self.max_unpersisted
            }
        }
    }

    /// Drop a run's cursor (its run reached a terminal frame). Returns
    /// whether an entry was removed and a persist is needed.
    pub fn clear(&mut self, run_id: &str) -> bool {
        self.entries.remove(run_id).is_some()
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = serde_json::to_string(&self.entries).context("serializing cursors")?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("writing {}", self.path.display()))?;
        self.last_write = Some(Instant::now());
        self.unpersisted = 0;
        Ok(())
    }
}
