//! Event buses.
//!
//! [`BroadcastBus`] fans events out to subscriber channels, dropping
//! them silently when nobody listens. [`RecordingBus`] keeps everything
//! in memory for assertions in tests.

use std::sync::mpsc::{self, Receiver, Sender};

use flowline_core::services::EventBus;
use parking_lot::Mutex;
use serde_json::Value;

/// One published event.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub channel: String,
    pub payload: Value,
}

/// Multi-consumer broadcast bus.
///
/// Every subscriber gets its own channel; publishing with no active
/// subscribers is a no-op, and disconnected subscribers are pruned on
/// the next publish.
#[derive(Default)]
pub struct BroadcastBus {
    subscribers: Mutex<Vec<Sender<BusEvent>>>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a subscriber that receives all future events.
    pub fn subscribe(&self) -> Receiver<BusEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, channel: &str, payload: Value) {
        let event = BusEvent {
            channel: channel.to_string(),
            payload,
        };
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// Bus that records every event for later inspection.
#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<BusEvent>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far.
    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().clone()
    }

    /// Channels of all events published so far, in order.
    pub fn channels(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.channel.clone()).collect()
    }

    /// Drain and return the recorded events.
    pub fn take(&self) -> Vec<BusEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

impl EventBus for RecordingBus {
    fn publish(&self, channel: &str, payload: Value) {
        self.events.lock().push(BusEvent {
            channel: channel.to_string(),
            payload,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = BroadcastBus::new();
        bus.publish("flow-set", json!({"tag": "orders"}));
    }

    #[test]
    fn every_subscriber_receives_the_event() {
        let bus = BroadcastBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.publish("workflow-set", json!({"id": "i-1"}));

        for rx in [rx1, rx2] {
            let event = rx.recv().unwrap();
            assert_eq!(event.channel, "workflow-set");
            assert_eq!(event.payload["id"], json!("i-1"));
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = BroadcastBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish("flow-set", json!({}));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn work_defaults_to_publish() {
        let bus = BroadcastBus::new();
        let rx = bus.subscribe();
        bus.work("jobs", json!({"n": 1}));
        assert_eq!(rx.recv().unwrap().channel, "jobs");
    }

    #[test]
    fn recording_bus_keeps_order() {
        let bus = RecordingBus::new();
        bus.publish("a", json!(1));
        bus.publish("b", json!(2));
        assert_eq!(bus.channels(), vec!["a", "b"]);
        assert_eq!(bus.take().len(), 2);
        assert!(bus.events().is_empty());
    }
}
