//! In-process signaling store.
//!
//! Keeps signal and presence rows in memory and fans changes out to
//! subscribers over a broadcast channel. Used for local loopback calls and
//! throughout the tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use duet_shared::protocol::{PresenceRecord, SignalRecord};
use duet_shared::types::{PeerId, RoomId};

use crate::store::{SignalStore, StoreError, StoreEvent, StoreSubscription};

const EVENT_BUFFER: usize = 256;

#[derive(Default)]
struct MemoryInner {
    signals: Vec<SignalRecord>,
    presence: HashMap<(String, String), PresenceRecord>,
    subscriptions: HashMap<Uuid, JoinHandle<()>>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All signal rows, in insertion order.
    pub fn signals(&self) -> Vec<SignalRecord> {
        self.lock().signals.clone()
    }

    pub fn presence(&self, room: &str, user: &str) -> Option<PresenceRecord> {
        self.lock()
            .presence
            .get(&(room.to_string(), user.to_string()))
            .cloned()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches(event: &StoreEvent, room: &str, user: &str) -> bool {
    match event {
        StoreEvent::Signal(record) => record.room_id == room && record.to_peer == user,
        StoreEvent::Presence(record) => record.room_id == room,
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn subscribe(
        &self,
        room: &RoomId,
        user: &PeerId,
    ) -> Result<StoreSubscription, StoreError> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut source = self.events.subscribe();
        let room = room.as_str().to_string();
        let user = user.as_str().to_string();

        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if !matches(&event, &room, &user) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory store subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.lock().subscriptions.insert(id, forwarder);
        debug!(subscription = %id, "Memory store subscription opened");
        Ok(StoreSubscription { id, events: rx })
    }

    async fn unsubscribe(&self, subscription_id: Uuid) -> Result<(), StoreError> {
        match self.lock().subscriptions.remove(&subscription_id) {
            Some(handle) => {
                handle.abort();
                debug!(subscription = %subscription_id, "Memory store subscription closed");
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn insert_signal(&self, record: &SignalRecord) -> Result<(), StoreError> {
        self.lock().signals.push(record.clone());
        self.publish(StoreEvent::Signal(record.clone()));
        Ok(())
    }

    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        self.lock().presence.insert(
            (record.room_id.clone(), record.user_id.clone()),
            record.clone(),
        );
        self.publish(StoreEvent::Presence(record.clone()));
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        room: &RoomId,
        user: &PeerId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (room.as_str().to_string(), user.as_str().to_string());
        match inner.presence.get_mut(&key) {
            Some(record) => {
                record.last_heartbeat = at;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_shared::protocol::SignalMessage;
    use duet_shared::types::{PresenceStatus, SignalType};
    use serde_json::json;

    fn ids() -> (RoomId, PeerId) {
        (
            RoomId::parse("room-1").unwrap(),
            PeerId::parse("bob").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_subscription_filters_by_recipient_and_room() {
        let store = MemoryStore::new();
        let (room, bob) = ids();
        let mut sub = store.subscribe(&room, &bob).await.unwrap();

        let to_carol = SignalMessage::new(SignalType::Offer, "alice", "carol", json!("x"));
        let other_room = SignalMessage::new(SignalType::Offer, "alice", "bob", json!("y"));
        let to_bob = SignalMessage::new(SignalType::Offer, "alice", "bob", json!("z"));

        store.insert_signal(&to_carol.to_record("room-1")).await.unwrap();
        store.insert_signal(&other_room.to_record("room-2")).await.unwrap();
        store.insert_signal(&to_bob.to_record("room-1")).await.unwrap();

        match sub.events.recv().await.unwrap() {
            StoreEvent::Signal(record) => assert_eq!(record.payload, json!("z")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(store.signals().len(), 3);
    }

    #[tokio::test]
    async fn test_presence_upsert_and_heartbeat() {
        let store = MemoryStore::new();
        let (room, bob) = ids();

        assert_eq!(
            store.touch_heartbeat(&room, &bob, Utc::now()).await,
            Err(StoreError::NotFound)
        );

        let record = PresenceRecord {
            room_id: "room-1".into(),
            user_id: "bob".into(),
            status: PresenceStatus::Joined,
            last_heartbeat: Utc::now(),
            announced_at: None,
        };
        store.upsert_presence(&record).await.unwrap();
        store.upsert_presence(&record).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(30);
        store.touch_heartbeat(&room, &bob, later).await.unwrap();
        assert_eq!(
            store.presence("room-1", "bob").unwrap().last_heartbeat,
            later
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let store = MemoryStore::new();
        let (room, bob) = ids();
        let sub = store.subscribe(&room, &bob).await.unwrap();
        assert_eq!(store.active_subscriptions(), 1);

        store.unsubscribe(sub.id).await.unwrap();
        assert_eq!(store.active_subscriptions(), 0);
        assert_eq!(store.unsubscribe(sub.id).await, Err(StoreError::NotFound));
    }
}
