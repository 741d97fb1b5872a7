//! Room-scoped signaling client.
//!
//! One client per call participant. `connect()` opens a store subscription,
//! announces presence and spawns two tasks: the event dispatcher (store
//! events -> observers) and the presence heartbeat. Both are aborted on
//! `disconnect()` or drop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use duet_shared::error::{ConfigError, ValidationError};
use duet_shared::protocol::{PresenceEvent, PresenceRecord, SignalMessage};
use duet_shared::timing::Throttle;
use duet_shared::types::{PeerId, PresenceStatus, RoomId, SignalType};
use duet_shared::validation::validate_signal;

use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::handlers::{Observers, Unsubscribe};
use crate::rate_limit::SignalRateLimiter;
use crate::retry_queue::{QueuedSignal, RetryQueue};
use crate::store::{SignalStore, StoreEvent};

const DROP_WARNING_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What happened to a signal handed to [`SignalingClient::send_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Persisted by the store.
    Sent,
    /// Transient transport failure; kept for replay on the next connect.
    Queued,
    /// Over the per-window limit; dropped.
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    /// Set after too many consecutive heartbeat failures. Reconnecting is
    /// left to the caller.
    pub possibly_lost: bool,
    pub queued_signals: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalStats {
    pub signals_in_window: u32,
    pub limit: u32,
    pub rate_limited: bool,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Session {
    subscription_id: Uuid,
    heartbeat: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Session {
    fn abort(&self) {
        self.heartbeat.abort();
        self.dispatcher.abort();
    }
}

struct ClientState {
    session: Option<Session>,
    limiter: SignalRateLimiter,
    queue: RetryQueue,
    /// A replay is draining `queue`.
    flushing: bool,
}

/// Clears `flushing` if a replay is cancelled mid-way.
struct FlushGuard<'a> {
    client: &'a SignalingClient,
    armed: bool,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.client.lock().flushing = false;
        }
    }
}

/// Heartbeat bookkeeping shared with the heartbeat task.
#[derive(Debug, Default)]
struct Health {
    failures: AtomicU32,
    possibly_lost: AtomicBool,
}

impl Health {
    fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.possibly_lost.store(false, Ordering::SeqCst);
    }

    fn possibly_lost(&self) -> bool {
        self.possibly_lost.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct SignalingClient {
    room: RoomId,
    user: PeerId,
    heartbeat_interval: Duration,
    max_heartbeat_failures: u32,
    store: Arc<dyn SignalStore>,
    state: Mutex<ClientState>,
    health: Arc<Health>,
    /// Serializes connect/disconnect; never held by `send_signal`.
    lifecycle: tokio::sync::Mutex<()>,
    signal_handlers: Observers<SignalMessage>,
    presence_handlers: Observers<PresenceEvent>,
    drop_warning: Throttle,
}

impl SignalingClient {
    /// Validate `config` and build a disconnected client on top of `store`.
    pub fn new(config: SignalingConfig, store: Arc<dyn SignalStore>) -> Result<Self, SignalingError> {
        let (room, user) = config.validate()?;
        if config.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(ValidationError::InvalidConstraint {
                field: "heartbeat_interval".into(),
                reason: "must be greater than zero".into(),
            })
            .into());
        }

        Ok(Self {
            room,
            user,
            heartbeat_interval: config.heartbeat_interval,
            max_heartbeat_failures: config.max_heartbeat_failures,
            store,
            state: Mutex::new(ClientState {
                session: None,
                limiter: SignalRateLimiter::new(
                    config.max_signals_per_window,
                    config.rate_limit_window,
                ),
                queue: RetryQueue::new(config.retry_queue_capacity),
                flushing: false,
            }),
            health: Arc::new(Health::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            signal_handlers: Observers::new("signal"),
            presence_handlers: Observers::new("presence"),
            drop_warning: Throttle::new(DROP_WARNING_INTERVAL),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room
    }

    pub fn user_id(&self) -> &PeerId {
        &self.user
    }

    pub fn is_connected(&self) -> bool {
        self.lock().session.is_some()
    }

    /// Subscribe to the room, announce presence, start the heartbeat and
    /// replay queued signals.
    ///
    /// Calling this while connected is a no-op, unless the connection was
    /// flagged as possibly lost, in which case the session is rebuilt.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let _lifecycle = self.lifecycle.lock().await;

        let stale = {
            let mut state = self.lock();
            if state.session.is_some() && !self.health.possibly_lost() {
                warn!(room = %self.room, "Already connected, ignoring connect()");
                return Ok(());
            }
            state.session.take()
        };

        if let Some(stale) = stale {
            info!(room = %self.room, "Connection possibly lost, re-establishing");
            stale.abort();
            if let Err(e) = self.store.unsubscribe(stale.subscription_id).await {
                debug!(error = %e, "Stale subscription already gone");
            }
        }

        let subscription = self
            .store
            .subscribe(&self.room, &self.user)
            .await
            .map_err(|e| {
                error!(room = %self.room, error = %e, "Failed to subscribe to signaling channel");
                SignalingError::Connection(e)
            })?;

        let joined = self.presence_record(PresenceStatus::Joined);
        if let Err(e) = self.store.upsert_presence(&joined).await {
            error!(room = %self.room, error = %e, "Failed to announce presence");
            if let Err(e) = self.store.unsubscribe(subscription.id).await {
                warn!(error = %e, "Failed to release subscription after connect error");
            }
            return Err(SignalingError::Connection(e));
        }

        self.health.reset();

        let dispatcher = tokio::spawn(dispatch_events(
            subscription.events,
            self.user.clone(),
            self.signal_handlers.clone(),
            self.presence_handlers.clone(),
        ));
        let heartbeat = tokio::spawn(run_heartbeat(
            self.store.clone(),
            self.room.clone(),
            self.user.clone(),
            self.heartbeat_interval,
            self.max_heartbeat_failures,
            self.health.clone(),
        ));

        self.lock().session = Some(Session {
            subscription_id: subscription.id,
            heartbeat,
            dispatcher,
        });

        info!(
            room = %self.room,
            peer = %self.user,
            channel = %self.room.to_channel(),
            "Connected to signaling channel"
        );

        self.flush_queue().await;
        Ok(())
    }

    /// Replay queued signals oldest first. Stops at the first failure and
    /// puts that signal back at the head. Returns how many were sent; 0 if
    /// another task is already replaying.
    async fn flush_queue(&self) -> usize {
        match self.begin_flush() {
            Some(guard) => self.drain_queue(guard).await,
            None => 0,
        }
    }

    fn begin_flush(&self) -> Option<FlushGuard<'_>> {
        let mut state = self.lock();
        if state.flushing {
            return None;
        }
        state.flushing = true;
        Some(FlushGuard {
            client: self,
            armed: true,
        })
    }

    /// While this runs, `send_signal` appends to the queue instead of
    /// inserting directly, so replayed signals keep their place.
    async fn drain_queue(&self, mut guard: FlushGuard<'_>) -> usize {
        let mut replayed = 0;

        loop {
            let next = {
                let mut state = self.lock();
                let next = state.queue.pop_front();
                if next.is_none() {
                    state.flushing = false;
                    guard.armed = false;
                }
                next
            };
            let Some(mut item) = next else {
                break;
            };

            // Fresh transport id for every attempt.
            let record = item.message.to_record(self.room.as_str());
            match self.store.insert_signal(&record).await {
                Ok(()) => replayed += 1,
                Err(e) => {
                    item.attempts += 1;
                    warn!(
                        error = %e,
                        attempts = item.attempts,
                        "Replay of queued signal failed, halting replay"
                    );
                    let mut state = self.lock();
                    if let Some(dropped) = state.queue.push_front(item) {
                        warn!(kind = %dropped.message.kind, "Retry queue full, dropped signal");
                    }
                    state.flushing = false;
                    guard.armed = false;
                    break;
                }
            }
        }

        if replayed > 0 {
            info!(replayed, "Replayed queued signals");
        }
        replayed
    }

    fn enqueue(&self, message: SignalMessage) {
        if let Some(dropped) = self.lock().queue.push_back(QueuedSignal::new(message)) {
            warn!(kind = %dropped.message.kind, "Retry queue full, dropped oldest signal");
        }
    }

    /// Send a signal to `to` in this room.
    ///
    /// Signals over the per-window limit are dropped and reported as
    /// [`SendOutcome::RateLimited`]. Retryable transport failures queue the
    /// signal; other failures are returned. While earlier signals wait for
    /// replay, new ones are queued behind them.
    pub async fn send_signal(
        &self,
        to: &str,
        kind: SignalType,
        data: serde_json::Value,
    ) -> Result<SendOutcome, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let to = PeerId::parse(to).map_err(SignalingError::InvalidRecipient)?;

        if !self.lock().limiter.try_acquire() {
            if self.drop_warning.ready() {
                warn!(to = %to, kind = %kind, "Signal rate limit reached, dropping signals");
            }
            return Ok(SendOutcome::RateLimited);
        }

        let message = SignalMessage::new(kind, self.user.as_str(), to.as_str(), data);
        validate_signal(&message).map_err(SignalingError::InvalidSignal)?;

        // Signals still waiting for replay go out first.
        let flush = {
            let state = self.lock();
            if state.flushing {
                drop(state);
                debug!(to = %to, kind = %kind, "Replay in progress, queueing signal behind it");
                self.enqueue(message);
                return Ok(SendOutcome::Queued);
            }
            !state.queue.is_empty()
        };
        if flush {
            self.flush_queue().await;
            let state = self.lock();
            if state.flushing || !state.queue.is_empty() {
                drop(state);
                self.enqueue(message);
                return Ok(SendOutcome::Queued);
            }
        }

        let record = message.to_record(self.room.as_str());
        match self.store.insert_signal(&record).await {
            Ok(()) => {
                debug!(to = %to, kind = %kind, id = %record.id, "Signal sent");
                Ok(SendOutcome::Sent)
            }
            Err(e) if e.is_retryable() => {
                warn!(to = %to, kind = %kind, error = %e, "Signal send failed, queued for retry");
                self.enqueue(message);
                Ok(SendOutcome::Queued)
            }
            Err(e) => {
                error!(to = %to, kind = %kind, error = %e, "Signal send failed");
                Err(SignalingError::Transport(e))
            }
        }
    }

    /// Observe incoming signals addressed to this peer.
    pub fn on_signal<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&SignalMessage) + Send + Sync + 'static,
    {
        self.signal_handlers.register(handler)
    }

    /// Observe presence changes of the other peers in the room.
    pub fn on_presence<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.presence_handlers.register(handler)
    }

    /// Leave the room. Stops the heartbeat, announces "left" (best effort),
    /// closes the subscription, then drops all observers and queued signals.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(session) = self.lock().session.take() else {
            debug!(room = %self.room, "Not connected, ignoring disconnect()");
            return;
        };

        session.heartbeat.abort();

        let left = self.presence_record(PresenceStatus::Left);
        if let Err(e) = self.store.upsert_presence(&left).await {
            warn!(room = %self.room, error = %e, "Failed to announce departure");
        }

        if let Err(e) = self.store.unsubscribe(session.subscription_id).await {
            warn!(room = %self.room, error = %e, "Failed to close subscription");
        }
        session.dispatcher.abort();

        self.signal_handlers.clear();
        self.presence_handlers.clear();
        self.lock().queue.clear();
        self.health.reset();

        info!(room = %self.room, peer = %self.user, "Disconnected from signaling channel");
    }

    pub fn connection_state(&self) -> ConnectionState {
        let state = self.lock();
        ConnectionState {
            connected: state.session.is_some(),
            possibly_lost: self.health.possibly_lost(),
            queued_signals: state.queue.len(),
        }
    }

    pub fn signal_stats(&self) -> SignalStats {
        let snapshot = self.lock().limiter.snapshot();
        SignalStats {
            signals_in_window: snapshot.count,
            limit: snapshot.limit,
            rate_limited: snapshot.exhausted,
        }
    }

    fn presence_record(&self, status: PresenceStatus) -> PresenceRecord {
        let now = Utc::now();
        PresenceRecord {
            room_id: self.room.as_str().to_string(),
            user_id: self.user.as_str().to_string(),
            status,
            last_heartbeat: now,
            announced_at: Some(now),
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(session) = self.lock().session.take() {
            debug!(room = %self.room, "Signaling client dropped while connected");
            session.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn dispatch_events(
    mut events: mpsc::Receiver<StoreEvent>,
    user: PeerId,
    signals: Observers<SignalMessage>,
    presence: Observers<PresenceEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StoreEvent::Signal(record) => {
                if record.to_peer != user.as_str() {
                    continue;
                }
                match SignalMessage::from_record(&record) {
                    Ok(message) => {
                        debug!(from = %message.from, kind = %message.kind, "Signal received");
                        signals.dispatch(&message);
                    }
                    Err(e) => {
                        warn!(id = %record.id, error = %e, "Dropping invalid signal");
                    }
                }
            }
            StoreEvent::Presence(record) => {
                if record.user_id == user.as_str() {
                    continue;
                }
                debug!(user = %record.user_id, status = ?record.status, "Presence changed");
                presence.dispatch(&record.to_event());
            }
        }
    }
    debug!(peer = %user, "Signaling subscription closed");
}

async fn run_heartbeat(
    store: Arc<dyn SignalStore>,
    room: RoomId,
    user: PeerId,
    period: Duration,
    max_failures: u32,
    health: Arc<Health>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match store.touch_heartbeat(&room, &user, Utc::now()).await {
            Ok(()) => {
                if health.failures.swap(0, Ordering::SeqCst) > 0 {
                    info!(room = %room, "Heartbeat recovered");
                }
                health.possibly_lost.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                let failures = health.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(room = %room, failures, error = %e, "Heartbeat failed");
                if failures > max_failures && !health.possibly_lost.swap(true, Ordering::SeqCst) {
                    error!(room = %room, failures, "Signaling connection possibly lost");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    use duet_shared::protocol::SignalRecord;

    use crate::memory::MemoryStore;
    use crate::store::{StoreError, StoreSubscription};

    const HEARTBEAT: Duration = Duration::from_secs(30);

    /// MemoryStore wrapper with scripted failures and an operation log.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        insert_script: Mutex<VecDeque<Result<(), StoreError>>>,
        insert_delay: Mutex<Option<Duration>>,
        fail_subscribe: AtomicBool,
        fail_presence: AtomicBool,
        fail_heartbeat: AtomicBool,
        log: Mutex<Vec<String>>,
    }

    impl FlakyStore {
        fn script_inserts(&self, results: impl IntoIterator<Item = Result<(), StoreError>>) {
            self.insert_script.lock().unwrap().extend(results);
        }

        fn record(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SignalStore for FlakyStore {
        async fn subscribe(
            &self,
            room: &RoomId,
            user: &PeerId,
        ) -> Result<StoreSubscription, StoreError> {
            self.record("subscribe");
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(StoreError::Subscribe("channel error".into()));
            }
            self.inner.subscribe(room, user).await
        }

        async fn unsubscribe(&self, subscription_id: Uuid) -> Result<(), StoreError> {
            self.record("unsubscribe");
            self.inner.unsubscribe(subscription_id).await
        }

        async fn insert_signal(&self, record: &SignalRecord) -> Result<(), StoreError> {
            self.record("insert");
            let delay = *self.insert_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.insert_script.lock().unwrap().pop_front();
            match scripted {
                Some(Err(e)) => Err(e),
                _ => self.inner.insert_signal(record).await,
            }
        }

        async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
            self.record(format!("presence:{:?}", record.status).to_lowercase());
            if self.fail_presence.load(Ordering::SeqCst) {
                return Err(StoreError::Timeout);
            }
            self.inner.upsert_presence(record).await
        }

        async fn touch_heartbeat(
            &self,
            room: &RoomId,
            user: &PeerId,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.record("heartbeat");
            if self.fail_heartbeat.load(Ordering::SeqCst) {
                return Err(StoreError::Network("offline".into()));
            }
            self.inner.touch_heartbeat(room, user, at).await
        }
    }

    fn config(user: &str) -> SignalingConfig {
        let mut config = SignalingConfig::new("https://signal.example.com", "anon-key", "room-1", user);
        config.heartbeat_interval = HEARTBEAT;
        config
    }

    fn client(store: &Arc<FlakyStore>, user: &str) -> SignalingClient {
        SignalingClient::new(config(user), store.clone()).unwrap()
    }

    #[test]
    fn test_construction_validates_arguments() {
        let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());

        let bad = SignalingConfig::new("not-a-uri", "key", "room-1", "alice");
        assert!(matches!(
            SignalingClient::new(bad, store.clone()),
            Err(SignalingError::Config(ConfigError::InvalidEndpoint(_)))
        ));

        let bad = SignalingConfig::new("https://signal.example.com", "key", "r", "alice");
        assert!(matches!(
            SignalingClient::new(bad, store.clone()),
            Err(SignalingError::Config(ConfigError::Invalid(_)))
        ));

        let bad = SignalingConfig::new("https://signal.example.com", "", "room-1", "alice");
        assert!(matches!(
            SignalingClient::new(bad, store),
            Err(SignalingError::Config(ConfigError::Missing("api_key")))
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");

        alice.connect().await.unwrap();
        alice.connect().await.unwrap();

        assert!(alice.is_connected());
        assert_eq!(store.inner.active_subscriptions(), 1);
        assert_eq!(
            store.inner.presence("room-1", "alice").unwrap().status,
            PresenceStatus::Joined
        );
    }

    #[tokio::test]
    async fn test_connect_failures_surface_as_connection_errors() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");

        store.fail_subscribe.store(true, Ordering::SeqCst);
        assert!(matches!(
            alice.connect().await,
            Err(SignalingError::Connection(StoreError::Subscribe(_)))
        ));
        assert!(!alice.is_connected());

        store.fail_subscribe.store(false, Ordering::SeqCst);
        store.fail_presence.store(true, Ordering::SeqCst);
        assert!(matches!(
            alice.connect().await,
            Err(SignalingError::Connection(StoreError::Timeout))
        ));
        assert!(!alice.is_connected());
        assert_eq!(store.inner.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_send_requires_connection_and_valid_input() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");

        assert!(matches!(
            alice.send_signal("bob", SignalType::Offer, json!({})).await,
            Err(SignalingError::NotConnected)
        ));

        alice.connect().await.unwrap();
        assert!(matches!(
            alice.send_signal("b", SignalType::Offer, json!({})).await,
            Err(SignalingError::InvalidRecipient(_))
        ));

        let huge = json!({ "sdp": "a".repeat(70 * 1024) });
        assert!(matches!(
            alice.send_signal("bob", SignalType::Offer, huge).await,
            Err(SignalingError::InvalidSignal(ValidationError::TooLarge { .. }))
        ));
        assert!(store.inner.signals().is_empty());
    }

    #[tokio::test]
    async fn test_signal_delivered_to_recipient_only() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");
        let bob = client(&store, "bob");
        let carol = client(&store, "carol");

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let _bob_sub = bob.on_signal(move |msg| {
            let _ = bob_tx.send(msg.clone());
        });
        let (carol_tx, mut carol_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let _carol_sub = carol.on_signal(move |msg| {
            let _ = carol_tx.send(msg.clone());
        });

        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        carol.connect().await.unwrap();

        let offer = json!({ "sdp": "v=0" });
        assert_eq!(
            alice.send_signal("bob", SignalType::Offer, offer.clone()).await.unwrap(),
            SendOutcome::Sent
        );

        let received = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind, SignalType::Offer);
        assert_eq!(received.from, "alice");
        assert_eq!(received.to, "bob");
        assert_eq!(received.data, offer);

        tokio::task::yield_now().await;
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_reported_for_other_peers_only() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");
        let bob = client(&store, "bob");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = alice.on_presence(move |event| {
            let _ = tx.send(event.clone());
        });

        alice.connect().await.unwrap();
        bob.connect().await.unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined.user_id, "bob");
        assert_eq!(joined.status, PresenceStatus::Joined);

        bob.disconnect().await;
        let left = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(left.user_id, "bob");
        assert_eq!(left.status, PresenceStatus::Left);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_block_delivery() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");
        let bob = client(&store, "bob");

        let _bad = bob.on_signal(|_| panic!("handler bug"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _good = bob.on_signal(move |msg| {
            let _ = tx.send(msg.kind);
        });

        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        alice.send_signal("bob", SignalType::Bye, json!(null)).await.unwrap();
        alice.send_signal("bob", SignalType::Renegotiate, json!(null)).await.unwrap();

        for expected in [SignalType::Bye, SignalType::Renegotiate] {
            let kind = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(kind, expected);
        }
    }

    #[tokio::test]
    async fn test_unsubscribed_handler_not_called() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");
        let bob = client(&store, "bob");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx_removed = tx.clone();
        let removed = bob.on_signal(move |_| {
            let _ = tx_removed.send("removed");
        });
        let _kept = bob.on_signal(move |_| {
            let _ = tx.send("kept");
        });
        removed.unsubscribe();

        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        alice.send_signal("bob", SignalType::Answer, json!({})).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "kept");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rate_limited_signals_are_dropped() {
        let store = Arc::new(FlakyStore::default());
        let mut cfg = config("alice");
        cfg.max_signals_per_window = 5;
        let alice = SignalingClient::new(cfg, store.clone()).unwrap();
        alice.connect().await.unwrap();

        let mut outcomes = Vec::new();
        for n in 0..8 {
            outcomes.push(
                alice
                    .send_signal("bob", SignalType::IceCandidate, json!(n))
                    .await
                    .unwrap(),
            );
        }

        let sent = outcomes.iter().filter(|o| **o == SendOutcome::Sent).count();
        let dropped = outcomes
            .iter()
            .filter(|o| **o == SendOutcome::RateLimited)
            .count();
        assert_eq!(sent, 5);
        assert_eq!(dropped, 3);
        assert_eq!(store.inner.signals().len(), 5);
        assert_eq!(alice.connection_state().queued_signals, 0);
        assert_eq!(
            alice.signal_stats(),
            SignalStats {
                signals_in_window: 5,
                limit: 5,
                rate_limited: true
            }
        );
    }

    #[tokio::test]
    async fn test_retryable_failure_queues_and_fatal_failure_errors() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");
        alice.connect().await.unwrap();

        store.script_inserts([Err(StoreError::Timeout)]);
        assert_eq!(
            alice.send_signal("bob", SignalType::Offer, json!(1)).await.unwrap(),
            SendOutcome::Queued
        );
        assert_eq!(alice.connection_state().queued_signals, 1);

        // The queued signal goes out ahead of the next one, which is rejected.
        store.script_inserts([
            Ok(()),
            Err(StoreError::Rejected {
                status: 403,
                message: "denied".into(),
            }),
        ]);
        assert!(matches!(
            alice.send_signal("bob", SignalType::Offer, json!(2)).await,
            Err(SignalingError::Transport(StoreError::Rejected { status: 403, .. }))
        ));
        assert_eq!(alice.connection_state().queued_signals, 0);
        let payloads: Vec<_> = store.inner.signals().iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_waits_behind_pending_replay() {
        let store = Arc::new(FlakyStore::default());
        let alice = Arc::new(client(&store, "alice"));
        alice.connect().await.unwrap();

        // Second send retries the head first, fails, and queues behind it.
        store.script_inserts((0..2).map(|_| Err(StoreError::Network("down".into()))));
        for n in 0..2 {
            assert_eq!(
                alice.send_signal("bob", SignalType::IceCandidate, json!(n)).await.unwrap(),
                SendOutcome::Queued
            );
        }
        assert_eq!(alice.connection_state().queued_signals, 2);

        store.fail_heartbeat.store(true, Ordering::SeqCst);
        tokio::time::sleep(HEARTBEAT * 4 + Duration::from_secs(1)).await;
        assert!(alice.connection_state().possibly_lost);
        store.fail_heartbeat.store(false, Ordering::SeqCst);

        // Slow inserts keep the reconnect replay in flight while we send.
        *store.insert_delay.lock().unwrap() = Some(Duration::from_millis(200));
        let reconnect = tokio::spawn({
            let alice = alice.clone();
            async move { alice.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            alice.send_signal("bob", SignalType::IceCandidate, json!(2)).await.unwrap(),
            SendOutcome::Queued
        );
        reconnect.await.unwrap().unwrap();

        let payloads: Vec<_> = store.inner.signals().iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(alice.connection_state().queued_signals, 0);

        // With the queue empty, sends go straight to the store again.
        assert_eq!(
            alice.send_signal("bob", SignalType::Offer, json!(3)).await.unwrap(),
            SendOutcome::Sent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failures_flag_possibly_lost() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");
        alice.connect().await.unwrap();

        tokio::time::sleep(HEARTBEAT + Duration::from_secs(1)).await;
        assert_eq!(
            store.log().iter().filter(|e| *e == "heartbeat").count(),
            1
        );

        store.fail_heartbeat.store(true, Ordering::SeqCst);
        tokio::time::sleep(HEARTBEAT * 3).await;
        assert!(!alice.connection_state().possibly_lost);

        tokio::time::sleep(HEARTBEAT).await;
        let state = alice.connection_state();
        assert!(state.connected);
        assert!(state.possibly_lost);

        store.fail_heartbeat.store(false, Ordering::SeqCst);
        tokio::time::sleep(HEARTBEAT).await;
        assert!(!alice.connection_state().possibly_lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_queue_in_order_and_halts_on_failure() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");
        alice.connect().await.unwrap();

        store.script_inserts((0..3).map(|_| Err(StoreError::Network("down".into()))));
        for n in 0..3 {
            assert_eq!(
                alice.send_signal("bob", SignalType::IceCandidate, json!(n)).await.unwrap(),
                SendOutcome::Queued
            );
        }

        // A healthy connection ignores connect().
        alice.connect().await.unwrap();
        assert_eq!(alice.connection_state().queued_signals, 3);

        store.fail_heartbeat.store(true, Ordering::SeqCst);
        tokio::time::sleep(HEARTBEAT * 4 + Duration::from_secs(1)).await;
        assert!(alice.connection_state().possibly_lost);

        store.script_inserts([Ok(()), Err(StoreError::Timeout)]);
        alice.connect().await.unwrap();
        assert_eq!(store.inner.active_subscriptions(), 1);
        let payloads: Vec<_> = store.inner.signals().iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(0)]);
        assert_eq!(alice.connection_state().queued_signals, 2);
        assert!(!alice.connection_state().possibly_lost);

        tokio::time::sleep(HEARTBEAT * 4 + Duration::from_secs(1)).await;
        assert!(alice.connection_state().possibly_lost);
        alice.connect().await.unwrap();

        let signals = store.inner.signals();
        let payloads: Vec<_> = signals.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(alice.connection_state().queued_signals, 0);

        let mut ids: Vec<_> = signals.iter().map(|r| r.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_order_and_idempotence() {
        let store = Arc::new(FlakyStore::default());
        let alice = client(&store, "alice");
        let _sub = alice.on_signal(|_| {});

        alice.disconnect().await;
        assert!(store.log().is_empty());

        alice.connect().await.unwrap();
        store.script_inserts([Err(StoreError::Timeout)]);
        alice.send_signal("bob", SignalType::Offer, json!({})).await.unwrap();
        assert_eq!(alice.connection_state().queued_signals, 1);

        store.fail_presence.store(true, Ordering::SeqCst);
        alice.disconnect().await;

        let log = store.log();
        let tail: Vec<_> = log.iter().rev().take(2).rev().cloned().collect();
        assert_eq!(tail, vec!["presence:left".to_string(), "unsubscribe".to_string()]);
        assert_eq!(store.inner.active_subscriptions(), 0);

        let state = alice.connection_state();
        assert!(!state.connected);
        assert_eq!(state.queued_signals, 0);
        assert!(alice.signal_handlers.is_empty());

        // No heartbeat outlives disconnect().
        let entries = store.log().len();
        tokio::time::sleep(HEARTBEAT * 3).await;
        alice.disconnect().await;
        assert_eq!(store.log().len(), entries);
    }
}
