//! HTTP signaling store speaking a PostgREST-style API.
//!
//! Tables:
//! - `signals`  (append-only; `seq` bigserial assigned by the store, `room_id`,
//!   `from_peer`, `to_peer`, `kind`, `payload`, `created_at`)
//! - `presence` (unique on `room_id, user_id`; `status`, `last_heartbeat`,
//!   `announced_at`)
//!
//! Subscriptions poll both tables on a fixed interval and forward rows that
//! are new (signals) or changed (presence) since the previous poll. Signals
//! are paged by `seq`, never by the sender's `created_at`, so replayed or
//! clock-skewed rows are still delivered. Poll failures back off
//! exponentially.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use duet_shared::backoff::Backoff;
use duet_shared::error::ConfigError;
use duet_shared::protocol::{PresenceRecord, SignalRecord};
use duet_shared::types::{PeerId, PresenceStatus, RoomId};

use crate::store::{SignalStore, StoreError, StoreEvent, StoreSubscription};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_BACKOFF_BASE: Duration = Duration::from_millis(500);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(30);

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StoreError::Timeout
        } else if e.is_connect() || e.is_request() {
            StoreError::Network(e.to_string())
        } else if let Some(status) = e.status() {
            StoreError::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            StoreError::Serialization(e.to_string())
        } else {
            StoreError::Other(e.to_string())
        }
    }
}

/// Parse and check a store endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(endpoint.trim())
        .map_err(|e| ConfigError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::InvalidEndpoint(format!(
            "{endpoint}: expected an http(s) URL with a host"
        )));
    }
    Ok(url)
}

#[derive(Clone)]
struct RestApi {
    client: Client,
    base: Url,
    api_key: String,
}

impl RestApi {
    fn table_url(&self, table: &str) -> Result<Url, StoreError> {
        self.base
            .join(&format!("rest/v1/{table}"))
            .map_err(|e| StoreError::Other(format!("Bad table URL: {e}")))
    }

    fn request(&self, method: Method, table: &str) -> Result<RequestBuilder, StoreError> {
        Ok(self
            .client
            .request(method, self.table_url(table)?)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key))
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StoreError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, StoreError> {
        let response = self.execute(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

pub struct RestStore {
    api: RestApi,
    poll_interval: Duration,
    polls: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl RestStore {
    pub fn new(endpoint: &str, api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ConfigError::Missing("api_key"));
        }
        let mut base = parse_endpoint(endpoint)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidEndpoint(format!("HTTP client: {e}")))?;

        info!(endpoint = %base, "Using REST signaling store");

        Ok(Self {
            api: RestApi {
                client,
                base,
                api_key,
            },
            poll_interval: DEFAULT_POLL_INTERVAL,
            polls: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Drop for RestStore {
    fn drop(&mut self) {
        let polls = self.polls.lock().unwrap_or_else(|e| e.into_inner());
        for handle in polls.values() {
            handle.abort();
        }
    }
}

/// A signal row as read back, with its store-assigned position.
#[derive(Deserialize)]
struct SignalRow {
    seq: i64,
    #[serde(flatten)]
    record: SignalRecord,
}

#[derive(Deserialize)]
struct SeqRow {
    seq: i64,
}

struct PollState {
    room: String,
    user: String,
    last_seq: i64,
    presence: HashMap<String, (PresenceStatus, Option<DateTime<Utc>>)>,
}

impl PollState {
    /// Position the cursor after the newest signal already addressed to us.
    async fn seek_latest(&mut self, api: &RestApi) -> Result<(), StoreError> {
        let latest: Vec<SeqRow> = api
            .fetch(api.request(Method::GET, "signals")?.query(&[
                ("select", "seq".to_string()),
                ("room_id", format!("eq.{}", self.room)),
                ("to_peer", format!("eq.{}", self.user)),
                ("order", "seq.desc".to_string()),
                ("limit", "1".to_string()),
            ]))
            .await?;
        self.last_seq = latest.first().map_or(0, |row| row.seq);
        Ok(())
    }

    async fn poll(&mut self, api: &RestApi) -> Result<Vec<StoreEvent>, StoreError> {
        let signals: Vec<SignalRow> = api
            .fetch(api.request(Method::GET, "signals")?.query(&[
                ("room_id", format!("eq.{}", self.room)),
                ("to_peer", format!("eq.{}", self.user)),
                ("seq", format!("gt.{}", self.last_seq)),
                ("order", "seq.asc".to_string()),
            ]))
            .await?;

        let presence: Vec<PresenceRecord> = api
            .fetch(
                api.request(Method::GET, "presence")?
                    .query(&[("room_id", format!("eq.{}", self.room))]),
            )
            .await?;

        let mut events = Vec::with_capacity(signals.len() + presence.len());
        for row in signals {
            self.last_seq = self.last_seq.max(row.seq);
            events.push(StoreEvent::Signal(row.record));
        }
        for record in presence {
            let seen = (record.status, record.announced_at);
            // Heartbeat-only updates are not presence changes.
            let changed = self.presence.get(&record.user_id) != Some(&seen);
            self.presence.insert(record.user_id.clone(), seen);
            if changed {
                events.push(StoreEvent::Presence(record));
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl SignalStore for RestStore {
    async fn subscribe(
        &self,
        room: &RoomId,
        user: &PeerId,
    ) -> Result<StoreSubscription, StoreError> {
        let mut state = PollState {
            room: room.as_str().to_string(),
            user: user.as_str().to_string(),
            last_seq: 0,
            presence: HashMap::new(),
        };

        // The first round trip doubles as the subscription handshake: if the
        // store is unreachable, subscribing fails.
        state
            .seek_latest(&self.api)
            .await
            .map_err(|e| StoreError::Subscribe(e.to_string()))?;
        let initial = state
            .poll(&self.api)
            .await
            .map_err(|e| StoreError::Subscribe(e.to_string()))?;

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(256);
        let api = self.api.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            for event in initial {
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            let mut backoff = Backoff::new(POLL_BACKOFF_BASE, POLL_BACKOFF_MAX);
            loop {
                tokio::time::sleep(interval).await;
                match state.poll(&api).await {
                    Ok(events) => {
                        backoff.reset();
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(
                            error = %e,
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "Signaling poll failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        self.polls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle);
        debug!(subscription = %id, room = %room, "REST subscription opened");

        Ok(StoreSubscription { id, events: rx })
    }

    async fn unsubscribe(&self, subscription_id: Uuid) -> Result<(), StoreError> {
        let handle = self
            .polls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&subscription_id);
        match handle {
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn insert_signal(&self, record: &SignalRecord) -> Result<(), StoreError> {
        let builder = self
            .api
            .request(Method::POST, "signals")?
            .header("Prefer", "return=minimal")
            .json(record);
        self.api.execute(builder).await?;
        Ok(())
    }

    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let builder = self
            .api
            .request(Method::POST, "presence")?
            .query(&[("on_conflict", "room_id,user_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(record);
        self.api.execute(builder).await?;
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        room: &RoomId,
        user: &PeerId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let builder = self
            .api
            .request(Method::PATCH, "presence")?
            .query(&[
                ("room_id", format!("eq.{room}")),
                ("user_id", format!("eq.{user}")),
            ])
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({ "last_heartbeat": at }));
        self.api.execute(builder).await?;
        Ok(())
    }
}
