//! Publish/subscribe fan-out: one producer drains the upstream stream, N subscribers
//! each own a bounded queue (§4.3), keyed by coalesce key so every follower of a
//! request sees the same event sequence as the leader.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};

use crate::coalescer::CoalesceKey;
use crate::errors::ErrorBody;
use crate::router::RouteDecision;

/// Default per-subscriber bounded queue size (§4.3).
pub const DEFAULT_BUFFER_SIZE: usize = 256;
/// How long subscriptions keep draining after the publisher closes (§4.3).
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Events flowing through the hub, mirroring the SSE wire events (§6.2) one-to-one so
/// the SSE encoder can translate without re-deriving any of this state.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum HubEvent {
    /// Forces proxy flush; emitted once at handler entry, outside the hub itself, but
    /// also used as the periodic heartbeat when no delta has been sent for 15s.
    Ping,
    /// Router decision, emitted once before upstream acquisition.
    Router(RouteDecision),
    /// First-byte metadata, emitted once.
    Meta {
        /// Time to first upstream byte, ms.
        ttft_ms: u64,
        /// Time spent waiting in the pacer, ms.
        queue_wait_ms: u64,
        /// Chosen provider.
        provider: String,
        /// Chosen model.
        model: String,
    },
    /// A content chunk. Concatenable by the client into the final assistant text.
    Delta {
        /// The chunk content.
        content: String,
    },
    /// Emitted only when a subscription's bounded queue overflowed.
    Dropped {
        /// Cumulative dropped-event count for this subscription.
        count: u64,
    },
    /// Emitted exactly once on normal completion.
    Done {
        /// Total wall time for the request, ms.
        total_ms: u64,
        /// Hash of the final content, so followers can compare.
        final_hash: String,
    },
    /// Emitted exactly once on failure; followed by connection close.
    Error(ErrorBody),
}

struct Subscription {
    tx: mpsc::Sender<HubEvent>,
    dropped: Arc<AtomicU64>,
}

/// One fan-out publisher for a single coalesce key. Created by the leader before
/// producing; subscribers register against it via [`StreamHub::subscribe`].
struct Publisher {
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Registry of active publishers, keyed by [`CoalesceKey`] (§4.3, §5).
///
/// Subscribe/unsubscribe is guarded by a single mutex; `publish` takes a snapshot of
/// the subscriber list and sends outside the lock, so a slow subscriber never blocks
/// registry mutation.
#[derive(Default)]
pub struct StreamHub {
    publishers: Mutex<HashMap<CoalesceKey, Arc<Publisher>>>,
}

/// A subscriber's handle: a receiving end plus its dropped-event counter.
pub struct Subscriber {
    rx: mpsc::Receiver<HubEvent>,
    dropped: Arc<AtomicU64>,
    last_reported_dropped: u64,
}

impl Subscriber {
    /// Await the next event. Returns `None` once the publisher closes and drains.
    ///
    /// A `Dropped` marker is synthesized here (rather than enqueued by the publisher)
    /// so it is never itself lost to the same overflow it reports: the bounded queue
    /// can stay completely full for the whole burst, and the consumer still observes
    /// the up-to-date cumulative count the next time it calls `recv`.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        let current = self.dropped.load(Ordering::SeqCst);
        if current != self.last_reported_dropped {
            self.last_reported_dropped = current;
            return Some(HubEvent::Dropped { count: current });
        }
        self.rx.recv().await
    }

    /// Cumulative count of events dropped due to queue overflow.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl StreamHub {
    /// Build an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn publisher_for(&self, key: CoalesceKey) -> Arc<Publisher> {
        let mut publishers = self.publishers.lock().await;
        Arc::clone(publishers.entry(key).or_insert_with(|| {
            Arc::new(Publisher { subscriptions: Mutex::new(Vec::new()) })
        }))
    }

    /// Register a new bounded-queue subscription against `key`. Idempotent creation
    /// of the publisher if it does not yet exist — a follower may subscribe before
    /// the leader has called `publisher_for` itself.
    pub async fn subscribe(&self, key: CoalesceKey, buffer_size: usize) -> Subscriber {
        let publisher = self.publisher_for(key).await;
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        publisher
            .subscriptions
            .lock()
            .await
            .push(Subscription { tx, dropped: Arc::clone(&dropped) });
        Subscriber { rx, dropped }
    }

    /// Non-blocking best-effort broadcast to every current subscription for `key`.
    ///
    /// On overflow this drops the event rather than blocking the publisher on one slow
    /// subscriber (§4.3), and bumps that subscriber's dropped counter. The counter is
    /// surfaced to the subscriber as a single consolidating `Dropped` event by
    /// [`Subscriber::recv`] rather than enqueued here, since a queue that is full
    /// enough to need dropping is also too full to reliably accept the marker itself.
    pub async fn publish(&self, key: &CoalesceKey, event: HubEvent) {
        let publisher = {
            let publishers = self.publishers.lock().await;
            match publishers.get(key) {
                Some(p) => Arc::clone(p),
                None => return,
            }
        };
        let subs = publisher.subscriptions.lock().await;
        for sub in subs.iter() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::SeqCst);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Flush any buffered events within the drain grace period, then release the
    /// publisher so a subsequent request with the same key starts fresh.
    pub async fn close(&self, key: &CoalesceKey) {
        tokio::time::sleep(DRAIN_GRACE).await;
        self.publishers.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CoalesceKey {
        CoalesceKey::new("k".into())
    }

    #[tokio::test]
    async fn subscriber_receives_events_published_after_subscribe() {
        let hub = StreamHub::new();
        let mut sub = hub.subscribe(key(), 8).await;
        hub.publish(&key(), HubEvent::Delta { content: "a".into() }).await;
        hub.publish(&key(), HubEvent::Delta { content: "b".into() }).await;
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        match (first, second) {
            (HubEvent::Delta { content: a }, HubEvent::Delta { content: b }) => {
                assert_eq!(a, "a");
                assert_eq!(b, "b");
            }
            _ => panic!("unexpected event shape"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_see_identical_ordered_sequence() {
        let hub = StreamHub::new();
        let mut s1 = hub.subscribe(key(), 8).await;
        let mut s2 = hub.subscribe(key(), 8).await;
        for i in 0..5 {
            hub.publish(&key(), HubEvent::Delta { content: i.to_string() }).await;
        }
        for i in 0..5 {
            let HubEvent::Delta { content: c1 } = s1.recv().await.unwrap() else { panic!() };
            let HubEvent::Delta { content: c2 } = s2.recv().await.unwrap() else { panic!() };
            assert_eq!(c1, i.to_string());
            assert_eq!(c2, i.to_string());
        }
    }

    #[tokio::test]
    async fn overflow_is_counted_and_surfaced_as_single_marker_on_recv() {
        let hub = StreamHub::new();
        let mut sub = hub.subscribe(key(), 2).await;
        for i in 0..10 {
            hub.publish(&key(), HubEvent::Delta { content: i.to_string() }).await;
        }
        assert_eq!(sub.dropped_count(), 8);

        // The consolidating marker arrives first, ahead of the queued deltas, and
        // carries the up-to-date cumulative count even though the queue itself never
        // had room to hold it.
        let HubEvent::Dropped { count } = sub.recv().await.unwrap() else { panic!("expected marker") };
        assert_eq!(count, 8);

        // A second recv with no further drops does not repeat the marker.
        let next = sub.recv().await.unwrap();
        assert!(matches!(next, HubEvent::Delta { .. }));
    }
}
