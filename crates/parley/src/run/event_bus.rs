//! In-process fan-out of freshly appended run events.
//!
//! The bus does no buffering or replay: a subscriber attached after an event
//! was emitted will never see it here and must read the event log instead.
//! That is why the stream endpoint replays from storage before subscribing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

/// A freshly appended event, as delivered to live subscribers.
#[derive(Debug, Clone)]
pub struct RunEventNotice {
    pub run_id: String,
    pub seq: i64,
    pub chunk: String,
}

#[derive(Default)]
struct BusInner {
    subscribers: DashMap<String, Vec<(u64, mpsc::UnboundedSender<RunEventNotice>)>>,
    next_id: AtomicU64,
}

/// Pub/sub keyed by run id. Cheap to clone.
#[derive(Clone, Default)]
pub struct RunEventBus {
    inner: Arc<BusInner>,
}

impl RunEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every current subscriber for its run.
    ///
    /// A subscriber whose receiver is gone is skipped; one dead subscriber
    /// never blocks delivery to the rest.
    pub fn emit(&self, notice: RunEventNotice) {
        let Some(subs) = self.inner.subscribers.get(&notice.run_id) else {
            return;
        };
        for (_, sender) in subs.iter() {
            let _ = sender.send(notice.clone());
        }
    }

    /// Register a live subscriber for a run. Multiple subscriptions per run
    /// are allowed (e.g. multiple tabs on the same chat).
    pub fn subscribe(&self, run_id: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .entry(run_id.to_string())
            .or_default()
            .push((id, tx));
        Subscription {
            bus: Arc::clone(&self.inner),
            run_id: run_id.to_string(),
            id,
            receiver: rx,
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, run_id: &str) -> usize {
        self.inner
            .subscribers
            .get(run_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// A live registration on the bus. Dropping it removes exactly this
/// registration.
pub struct Subscription {
    bus: Arc<BusInner>,
    run_id: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<RunEventNotice>,
}

impl Subscription {
    /// Next delivered event, or `None` once unregistered and drained.
    pub async fn recv(&mut self) -> Option<RunEventNotice> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RunEventNotice> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut remove_key = false;
        if let Some(mut subs) = self.bus.subscribers.get_mut(&self.run_id) {
            subs.retain(|(id, _)| *id != self.id);
            remove_key = subs.is_empty();
        }
        if remove_key {
            self.bus
                .subscribers
                .remove_if(&self.run_id, |_, subs| subs.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(run_id: &str, seq: i64) -> RunEventNotice {
        RunEventNotice {
            run_id: run_id.to_string(),
            seq,
            chunk: format!(r#"{{"type":"text-delta","delta":"{}"}}"#, seq),
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers_of_a_run() {
        let bus = RunEventBus::new();
        let mut a = bus.subscribe("r1");
        let mut b = bus.subscribe("r1");
        let mut other = bus.subscribe("r2");

        bus.emit(notice("r1", 1));

        assert_eq!(a.recv().await.unwrap().seq, 1);
        assert_eq!(b.recv().await.unwrap().seq, 1);
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let bus = RunEventBus::new();
        bus.emit(notice("r1", 1));

        let mut sub = bus.subscribe("r1");
        assert!(sub.try_recv().is_none());

        bus.emit(notice("r1", 2));
        assert_eq!(sub.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn drop_unregisters_exactly_one_subscription() {
        let bus = RunEventBus::new();
        let a = bus.subscribe("r1");
        let b = bus.subscribe("r1");
        assert_eq!(bus.subscriber_count("r1"), 2);

        drop(a);
        assert_eq!(bus.subscriber_count("r1"), 1);
        drop(b);
        assert_eq!(bus.subscriber_count("r1"), 0);
    }

    #[tokio::test]
    async fn dead_subscriber_does_not_block_others() {
        let bus = RunEventBus::new();
        let mut dead = bus.subscribe("r1");
        let mut live = bus.subscribe("r1");

        dead.receiver.close();
        bus.emit(notice("r1", 1));
        assert!(dead.try_recv().is_none());
        assert_eq!(live.recv().await.unwrap().seq, 1);
    }
}
