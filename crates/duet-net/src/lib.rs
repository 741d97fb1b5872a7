//! # duet-net
//!
//! Room-scoped signaling over a persisted store, and latency-based relay
//! selection.
//!
//! The [`SignalingClient`] talks to any [`SignalStore`]; [`MemoryStore`]
//! serves in-process calls and tests, [`RestStore`] a PostgREST-style HTTP
//! backend.

pub mod config;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod rate_limit;
pub mod rest;
pub mod retry_queue;
pub mod signaling;
pub mod store;
pub mod turn;

pub use config::{default_turn_servers, parse_turn_servers, RelayConfig, SignalingConfig};
pub use error::{SignalingError, TurnError};
pub use handlers::{Observers, Unsubscribe};
pub use memory::MemoryStore;
pub use rate_limit::{SignalRateLimiter, WindowSnapshot};
pub use rest::{parse_endpoint, RestStore};
pub use retry_queue::{QueuedSignal, RetryQueue};
pub use signaling::{ConnectionState, SendOutcome, SignalStats, SignalingClient};
pub use store::{SignalStore, StoreError, StoreEvent, StoreSubscription};
pub use turn::{HttpProbe, LatencyProbe, TurnSelector, TurnServer};
