//! Room fan-out: one local broadcast channel per room, carrying serialized `WsEvent`s.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::models::event::WsEvent;
use crate::services::presence::PresenceStore;

const ROOM_CHANNEL_CAPACITY: usize = 64;

pub const EVENT_PRESENCE_SNAPSHOT: &str = "presence_snapshot";

/// Manages per-room subscriptions for connected clients in this process.
#[derive(Clone, Default)]
pub struct RoomHub {
    /// room -> broadcast Sender. Dropped by `release` once nobody listens.
    rooms: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a receiver for the room's events.
    pub async fn subscribe(&self, room: &str) -> broadcast::Receiver<String> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send an event to every subscriber of the room. Returns how many receivers got it.
    pub async fn broadcast(
        &self,
        room: &str,
        event: &str,
        data: serde_json::Value,
    ) -> AppResult<usize> {
        let ws_event = WsEvent {
            event: event.to_string(),
            room: room.to_string(),
            data,
        };
        let payload = serde_json::to_string(&ws_event)?;
        let rooms = self.rooms.read().await;
        let count = rooms
            .get(room)
            .and_then(|tx| tx.send(payload).ok())
            .unwrap_or(0);
        debug!(room = %room, event = %event, count, "broadcast");
        Ok(count)
    }

    /// Push the room's current presence snapshot to its subscribers.
    pub async fn announce(&self, store: &PresenceStore, room: &str) -> AppResult<usize> {
        let users = store.get_presence(room).await;
        self.broadcast(room, EVENT_PRESENCE_SNAPSHOT, json!({ "users": users }))
            .await
    }

    /// Drop the room's channel if no receivers remain.
    pub async fn release(&self, room: &str) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room).is_some_and(|tx| tx.receiver_count() == 0) {
            rooms.remove(room);
            debug!(room = %room, "released room channel");
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Announce fresh snapshots to rooms the sweeper evicted users from.
    pub fn forward_evictions(&self, store: PresenceStore) -> JoinHandle<()> {
        let hub = self.clone();
        let mut evictions = store.subscribe_evictions();
        tokio::spawn(async move {
            loop {
                match evictions.recv().await {
                    Ok(eviction) => {
                        if let Err(e) = hub.announce(&store, &eviction.room).await {
                            warn!(room = %eviction.room, error = %e, "eviction announce failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "eviction listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("eviction forwarder stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let hub = RoomHub::new();
        let mut rx = hub.subscribe("doc-1").await;
        let count = hub
            .broadcast("doc-1", "custom", json!({ "n": 1 }))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let raw = rx.recv().await.unwrap();
        let event: WsEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event.event, "custom");
        assert_eq!(event.room, "doc-1");
        assert_eq!(event.data, json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_zero() {
        let hub = RoomHub::new();
        assert_eq!(hub.broadcast("empty", "x", json!({})).await.unwrap(), 0);
        drop(hub.subscribe("gone").await);
        assert_eq!(hub.broadcast("gone", "x", json!({})).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_keeps_rooms_with_listeners() {
        let hub = RoomHub::new();
        let rx = hub.subscribe("a").await;
        drop(hub.subscribe("b").await);
        hub.release("a").await;
        hub.release("b").await;
        assert_eq!(hub.room_count().await, 1);
        drop(rx);
        hub.release("a").await;
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn announce_sends_snapshot() {
        let hub = RoomHub::new();
        let store = PresenceStore::default();
        store.heartbeat("doc-1", "alice", "Alice", None, true).await;
        let mut rx = hub.subscribe("doc-1").await;

        hub.announce(&store, "doc-1").await.unwrap();
        let event: WsEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event.event, EVENT_PRESENCE_SNAPSHOT);
        assert_eq!(
            event.data,
            json!({ "users": [{ "id": "alice", "name": "Alice", "avatar": null, "idle": true }] })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn evictions_are_announced() {
        let hub = RoomHub::new();
        let store = PresenceStore::default();
        let forwarder = hub.forward_evictions(store.clone());
        let mut rx = hub.subscribe("room42").await;

        store.heartbeat("room42", "bob", "Bob", None, false).await;
        tokio::time::advance(Duration::from_secs(46)).await;
        store.sweep_once().await;

        let event: WsEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event.event, EVENT_PRESENCE_SNAPSHOT);
        assert_eq!(event.data, json!({ "users": [] }));
        forwarder.abort();
    }
}
