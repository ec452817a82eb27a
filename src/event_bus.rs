//! EventBus — in-process publish/subscribe over named topics.
//!
//! One `tokio::sync::broadcast` channel per topic, the same channel-per-concern shape as the
//! teacher's `paper_trading/engine.rs` Collector/Strategy/Executor wiring, plus a bounded
//! per-topic ring buffer so a late subscriber can still call `history(topic, since)`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

/// Opaque handle returned by `subscribe`; must be passed to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Topic {
    sender: broadcast::Sender<Event>,
    history: Mutex<VecDeque<Event>>,
    retention: usize,
}

impl Topic {
    fn new(capacity: usize, retention: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, history: Mutex::new(VecDeque::with_capacity(retention)), retention }
    }

    fn push_history(&self, event: Event) {
        let mut history = self.history.lock().unwrap();
        if history.len() == self.retention {
            history.pop_front();
        }
        history.push_back(event);
    }
}

/// Named-topic pub/sub with bounded per-topic retention. Publish never blocks on a slow
/// subscriber and never fails because a handler panicked or a subscriber lagged: broadcast lag
/// errors are logged and skipped, matching the "one handler failure never aborts the publish"
/// contract.
pub struct EventBus {
    topics: DashMap<String, Arc<Topic>>,
    channel_capacity: usize,
    retention: usize,
    next_seq: AtomicU64,
    next_sub_id: AtomicU64,
    subscriptions: DashMap<SubscriptionId, String>,
}

impl EventBus {
    pub fn new(channel_capacity: usize, retention: usize) -> Self {
        Self {
            topics: DashMap::new(),
            channel_capacity,
            retention,
            next_seq: AtomicU64::new(0),
            next_sub_id: AtomicU64::new(0),
            subscriptions: DashMap::new(),
        }
    }

    fn topic_for(&self, topic: &str) -> Arc<Topic> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Topic::new(self.channel_capacity, self.retention)))
            .clone()
    }

    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let event = Event { topic: topic.to_string(), seq, timestamp: chrono::Utc::now(), payload };
        let t = self.topic_for(topic);
        t.push_history(event.clone());
        // A broadcast send errors only when there are zero receivers; that's the expected
        // no-subscriber case, not a failure, so it's swallowed rather than propagated.
        let _ = t.sender.send(event);
    }

    pub fn subscribe(&self, topic: &str) -> (SubscriptionId, broadcast::Receiver<Event>) {
        let t = self.topic_for(topic);
        let id = SubscriptionId(self.next_sub_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.insert(id, topic.to_string());
        (id, t.sender.subscribe())
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        // broadcast::Receiver has no explicit detach; dropping the receiver (owned by the caller)
        // is what actually releases the slot. This just forgets the bookkeeping entry.
        if self.subscriptions.remove(&id).is_none() {
            warn!(?id, "unsubscribe called for unknown subscription");
        }
    }

    pub fn history(&self, topic: &str, since: Option<u64>) -> Vec<Event> {
        let Some(t) = self.topics.get(topic) else { return Vec::new() };
        let history = t.history.lock().unwrap();
        match since {
            Some(seq) => history.iter().filter(|e| e.seq > seq).cloned().collect(),
            None => history.iter().cloned().collect(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        // Core topics (position.*, instance.*) must survive a slow subscriber without dropping
        // events, so default retention is generous; callers can size per-deployment via `new`.
        Self::new(1024, 256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_observed_in_order_by_one_subscriber() {
        let bus = EventBus::new(16, 16);
        let (_id, mut rx) = bus.subscribe("instance.progress");
        bus.publish("instance.progress", serde_json::json!({"stage": 1}));
        bus.publish("instance.progress", serde_json::json!({"stage": 2}));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.seq < second.seq);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16, 16);
        bus.publish("position.opened", serde_json::json!({}));
        assert_eq!(bus.history("position.opened", None).len(), 1);
    }

    #[test]
    fn history_since_filters_already_seen_events() {
        let bus = EventBus::new(16, 16);
        bus.publish("instance.progress", serde_json::json!({"stage": 1}));
        bus.publish("instance.progress", serde_json::json!({"stage": 2}));
        let all = bus.history("instance.progress", None);
        let since_first = bus.history("instance.progress", Some(all[0].seq));
        assert_eq!(since_first.len(), 1);
    }

    #[test]
    fn history_ring_evicts_oldest_beyond_retention() {
        let bus = EventBus::new(16, 2);
        for i in 0..5 {
            bus.publish("instance.progress", serde_json::json!({"i": i}));
        }
        assert_eq!(bus.history("instance.progress", None).len(), 2);
    }
}
