//! Same-origin inter-tab signaling primitive.
//!
//! One [`SignalBus`] exists per browser context (origin); every tab attaches
//! a subscriber. A posted signal carries only the originating tab id and a
//! resource key — tabs are coupled through the key convention alone, never
//! through shared objects, so one tab's fault cannot corrupt another's
//! state.
//!
//! Delivery is at-least-once per subscriber that is attached at post time;
//! there is no durable log, so a tab attached later never sees earlier
//! signals. Posting with zero subscribers is a silent no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

/// A cross-tab notification that a named resource changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Tab that posted the signal
    pub tab_id: Uuid,
    /// Resource key, e.g. `"doc-<uuid>"`
    pub key: String,
}

/// The shared signal channel all tabs of one origin attach to.
#[derive(Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Signal>,
    posted: Arc<AtomicU64>,
    capacity: usize,
}

impl SignalBus {
    /// Create a bus buffering up to `capacity` signals per subscriber.
    /// Slow subscribers past that drop the oldest signals.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            posted: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Post a signal to every attached subscriber except none — filtering
    /// out the poster's own tab happens on the receiving side. Returns the
    /// number of subscribers that got it; zero is not an error.
    pub fn post(&self, signal: Signal) -> usize {
        let delivered = self.tx.send(signal).unwrap_or(0);
        self.posted.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Attach a subscriber (one per tab).
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Signals posted over the bus lifetime.
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_reaches_subscriber() {
        let bus = SignalBus::new(16);
        let mut rx = bus.subscribe();

        let tab = Uuid::new_v4();
        let delivered = bus.post(Signal { tab_id: tab, key: "doc-1".into() });
        assert_eq!(delivered, 1);

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.tab_id, tab);
        assert_eq!(signal.key, "doc-1");
    }

    #[tokio::test]
    async fn test_post_without_subscribers_is_noop() {
        let bus = SignalBus::new(16);
        let delivered = bus.post(Signal { tab_id: Uuid::new_v4(), key: "doc-1".into() });
        assert_eq!(delivered, 0);
        assert_eq!(bus.posted(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_signals() {
        let bus = SignalBus::new(16);
        bus.post(Signal { tab_id: Uuid::new_v4(), key: "doc-1".into() });

        let mut rx = bus.subscribe();
        // Nothing buffered for us; only signals posted from now on arrive
        bus.post(Signal { tab_id: Uuid::new_v4(), key: "doc-2".into() });
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.key, "doc-2");
    }

    #[tokio::test]
    async fn test_fan_out_to_many_subscribers() {
        let bus = SignalBus::new(16);
        let mut receivers: Vec<_> = (0..5).map(|_| bus.subscribe()).collect();
        assert_eq!(bus.subscriber_count(), 5);

        bus.post(Signal { tab_id: Uuid::new_v4(), key: "k".into() });
        for rx in &mut receivers {
            assert_eq!(rx.recv().await.unwrap().key, "k");
        }
    }

    #[tokio::test]
    async fn test_clones_share_one_channel() {
        let bus = SignalBus::new(16);
        let other = bus.clone();
        let mut rx = bus.subscribe();

        other.post(Signal { tab_id: Uuid::new_v4(), key: "shared".into() });
        assert_eq!(rx.recv().await.unwrap().key, "shared");
        assert_eq!(bus.posted(), 1);
    }

    #[test]
    fn test_capacity_accessor() {
        let bus = SignalBus::new(32);
        assert_eq!(bus.capacity(), 32);
    }
}
