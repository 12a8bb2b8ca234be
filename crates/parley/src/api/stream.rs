//! Per-connection pump for the resumable run event feed.
//!
//! Each stream connection runs one pump task: replay persisted events past
//! the client's cursor, then tail the live bus, with a heartbeat to keep
//! proxies from idling the connection out and a status poll that catches a
//! terminal transition whose bus emission this connection missed. Frames
//! carry the sequence number as the SSE `id:` line so clients resume from
//! exactly where they stopped; synthesized markers are sent without an id
//! because they have no row in the log.

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::debug;

use parley_protocol::{is_terminal_chunk, StreamEvent};

use crate::run::{GenerationRun, RunEventBus, RunRepository, RunStatus};

use super::state::StreamTimings;

const PING_FRAME: &[u8] = b": ping\n\n";

pub(crate) fn event_frame(seq: i64, chunk: &str) -> Bytes {
    Bytes::from(format!("id: {}\ndata: {}\n\n", seq, chunk))
}

fn data_frame(chunk: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", chunk))
}

struct Step {
    forwarded: usize,
    done: bool,
}

/// Forward stored events past `last_seq`. `done` is set when a terminal
/// marker went out or the client disconnected.
async fn forward_stored(
    runs: &RunRepository,
    run_id: &str,
    last_seq: &mut i64,
    tx: &mpsc::Sender<Bytes>,
) -> Result<Step> {
    let events = runs.events_after(run_id, *last_seq).await?;
    let mut forwarded = 0;
    for event in events {
        if tx.send(event_frame(event.seq, &event.chunk)).await.is_err() {
            return Ok(Step { forwarded, done: true });
        }
        *last_seq = event.seq;
        forwarded += 1;
        if is_terminal_chunk(&event.chunk) {
            return Ok(Step { forwarded, done: true });
        }
    }
    Ok(Step {
        forwarded,
        done: false,
    })
}

/// Close out a connection whose run finished without a terminal marker in
/// the log (validation failures write one; a crash-recovery sweep does not).
async fn synthesize_terminal(run: &GenerationRun, tx: &mpsc::Sender<Bytes>) -> Result<()> {
    if run.status() == RunStatus::Failed {
        let code = run.error.clone().unwrap_or_else(|| "run.failed".to_string());
        let chunk = serde_json::to_string(&StreamEvent::Error { error_text: code })?;
        if tx.send(data_frame(&chunk)).await.is_err() {
            return Ok(());
        }
    }
    let finish = serde_json::to_string(&StreamEvent::Finish)?;
    let _ = tx.send(data_frame(&finish)).await;
    Ok(())
}

/// Drive one stream connection to completion. Ownership and existence are
/// checked by the handler before this runs.
pub(crate) async fn pump_run_events(
    runs: RunRepository,
    bus: RunEventBus,
    timings: StreamTimings,
    run_id: String,
    after_seq: i64,
    tx: mpsc::Sender<Bytes>,
) {
    if let Err(e) = run_pump(&runs, &bus, &timings, &run_id, after_seq, &tx).await {
        debug!(run_id, error = %e, "run stream pump ended with error");
    }
}

async fn run_pump(
    runs: &RunRepository,
    bus: &RunEventBus,
    timings: &StreamTimings,
    run_id: &str,
    mut last_seq: i64,
    tx: &mpsc::Sender<Bytes>,
) -> Result<()> {
    // Replay history past the client's cursor.
    let step = forward_stored(runs, run_id, &mut last_seq, tx).await?;
    if step.done {
        return Ok(());
    }

    // The run may already be finished with nothing more to replay.
    let run = runs.get_required(run_id).await?;
    if run.is_terminal() && run.cursor <= last_seq {
        return synthesize_terminal(&run, tx).await;
    }

    // Tail the live bus. A second catch-up read covers events appended
    // between the replay read and the subscription.
    let mut sub = bus.subscribe(run_id);
    let step = forward_stored(runs, run_id, &mut last_seq, tx).await?;
    if step.done {
        return Ok(());
    }

    let mut heartbeat = interval(timings.heartbeat);
    heartbeat.tick().await;
    let mut poll = interval(timings.status_poll);
    poll.tick().await;
    let mut last_event_at = Instant::now();

    loop {
        tokio::select! {
            notice = sub.recv() => {
                let Some(notice) = notice else {
                    return Ok(());
                };
                // The catch-up read may have forwarded this one already.
                if notice.seq <= last_seq {
                    continue;
                }
                if tx.send(event_frame(notice.seq, &notice.chunk)).await.is_err() {
                    return Ok(());
                }
                last_seq = notice.seq;
                last_event_at = Instant::now();
                if is_terminal_chunk(&notice.chunk) {
                    return Ok(());
                }
            }
            _ = heartbeat.tick() => {
                if tx.send(Bytes::from_static(PING_FRAME)).await.is_err() {
                    return Ok(());
                }
            }
            _ = poll.tick() => {
                if last_event_at.elapsed() < timings.recency_window {
                    continue;
                }
                let step = forward_stored(runs, run_id, &mut last_seq, tx).await?;
                if step.forwarded > 0 {
                    last_event_at = Instant::now();
                }
                if step.done {
                    return Ok(());
                }
                let run = runs.get_required(run_id).await?;
                if run.is_terminal() {
                    return synthesize_terminal(&run, tx).await;
                }
            }
        }
    }
}
