//! Local buffer of events waiting for the producer loop.
//!
//! The queue fills up while Kafka is unreachable. It is bounded: once it
//! holds `capacity` events, every new event evicts the oldest unsent one.
//! Losing the oldest undelivered event under a long outage is the accepted
//! price for bounded memory.

use crate::messages::OutboundEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Bounded, insertion-ordered, multi-writer / single-reader event queue
#[derive(Debug)]
pub struct ProduceQueue {
    items: Mutex<VecDeque<OutboundEvent>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl ProduceQueue {
    /// Create a queue holding at most `capacity` events (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Number of events discarded to make room since startup
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Append an event. Never blocks on the broker and never fails.
    pub fn enqueue(&self, event: OutboundEvent) {
        let dropped = {
            let mut items = self.items.lock();
            let dropped = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(event);
            dropped
        };

        if let Some(dropped) = dropped {
            self.record_eviction(&dropped, "oldest");
        }
    }

    /// Remove and return everything currently queued, oldest first
    pub fn dequeue_all(&self) -> Vec<OutboundEvent> {
        let mut items = self.items.lock();
        items.drain(..).collect()
    }

    /// Put unsent events back at the head of the queue, keeping their order.
    ///
    /// Events enqueued meanwhile stay behind them. If the total exceeds
    /// capacity the newest events are evicted from the tail, so the head of
    /// the requeued batch is always delivered next.
    pub fn requeue_front(&self, events: Vec<OutboundEvent>) {
        let dropped: Vec<OutboundEvent> = {
            let mut items = self.items.lock();
            for event in events.into_iter().rev() {
                items.push_front(event);
            }
            let keep = items.len().min(self.capacity);
            items.drain(keep..).collect()
        };

        for event in &dropped {
            self.record_eviction(event, "newest");
        }
    }

    fn record_eviction(&self, event: &OutboundEvent, which: &'static str) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("produce_queue.evicted").increment(1);
        warn!(
            topic = %event.topic(),
            payload_id = event.payload_id().unwrap_or("unknown"),
            capacity = self.capacity,
            evicted = which,
            "Produce queue full, dropped unsent event"
        );
    }
}
