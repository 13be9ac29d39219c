use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::notifier::{RealtimeEvent, RealtimeNotifier};

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub room: String,
    pub event: RealtimeEvent,
    pub payload: Value,
}

/// A notifier that remembers everything published to it.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<PublishedEvent>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_for(&self, room: &str) -> Vec<PublishedEvent> {
        self.events().into_iter().filter(|e| e.room == room).collect()
    }

    pub fn count(&self, event: RealtimeEvent) -> usize {
        self.events().iter().filter(|e| e.event == event).count()
    }
}

impl RealtimeNotifier for RecordingNotifier {
    fn publish(&self, room: &str, event: RealtimeEvent, payload: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push(PublishedEvent { room: room.to_string(), event, payload });
        }
    }
}
