//! An in-process [`RealtimeNotifier`] that fans events out to Server-Sent Event connections.
//!
//! Every room has its own broadcast channel. A room comes into being when the first client joins it, and events
//! published to a room that nobody has joined are dropped. Slow clients that fall behind lose the oldest events rather
//! than holding up the publisher.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bitmarket_engine::notifier::{RealtimeEvent, RealtimeNotifier};
use bytes::Bytes;
use futures::{stream, Stream};
use log::*;
use serde_json::Value;
use tokio::sync::broadcast;

const DEFAULT_ROOM_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct RoomMessage {
    pub event: RealtimeEvent,
    pub payload: Value,
}

impl RoomMessage {
    /// The message as a single SSE frame.
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.payload)
    }
}

type Rooms = HashMap<String, broadcast::Sender<RoomMessage>>;

#[derive(Clone)]
pub struct RoomHub {
    rooms: Arc<RwLock<Rooms>>,
    capacity: usize,
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM_CAPACITY)
    }
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), capacity: capacity.max(1) }
    }

    /// Joins `room`. The client leaves the room when the receiver is dropped.
    pub fn join(&self, room: &str) -> broadcast::Receiver<RoomMessage> {
        let mut rooms = self.write_rooms();
        let sender = rooms.entry(room.to_string()).or_insert_with(|| {
            debug!("📣️ Opening room {room}");
            broadcast::channel(self.capacity).0
        });
        sender.subscribe()
    }

    /// The number of clients currently in `room`.
    pub fn members(&self, room: &str) -> usize {
        self.read_rooms().get(room).map(|s| s.receiver_count()).unwrap_or(0)
    }

    /// Joins `room` and returns the stream of SSE frames for it.
    pub fn sse_stream(&self, room: &str) -> impl Stream<Item = Result<Bytes, actix_web::Error>> + 'static {
        let receiver = self.join(room);
        let room = room.to_string();
        stream::unfold(receiver, move |mut receiver| {
            let room = room.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => return Some((Ok(Bytes::from(message.to_sse_frame())), receiver)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("📣️ A client in {room} fell behind and missed {n} events");
                        },
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
    }

    fn read_rooms(&self) -> RwLockReadGuard<'_, Rooms> {
        self.rooms.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_rooms(&self) -> RwLockWriteGuard<'_, Rooms> {
        self.rooms.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RealtimeNotifier for RoomHub {
    fn publish(&self, room: &str, event: RealtimeEvent, payload: Value) {
        let delivered = {
            let rooms = self.read_rooms();
            match rooms.get(room) {
                Some(sender) => sender.send(RoomMessage { event, payload }).ok(),
                None => None,
            }
        };
        match delivered {
            Some(n) => trace!("📣️ {event} delivered to {n} clients in {room}"),
            None => {
                trace!("📣️ Nobody is in {room}. Dropping {event}");
                // Everyone left since the room was opened
                let mut rooms = self.write_rooms();
                if rooms.get(room).is_some_and(|s| s.receiver_count() == 0) {
                    rooms.remove(room);
                    debug!("📣️ Closed empty room {room}");
                }
            },
        }
    }
}
