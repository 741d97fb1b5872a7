//! Periodic link-quality monitoring for one peer connection.
//!
//! A tokio task polls the [`StatsSource`] on a fixed interval, reduces each
//! snapshot into a [`StatsReport`] and hands valid reports to the callback.
//! The task stops by itself once the connection fails or closes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use duet_shared::constants::{MAX_TRACKED_STREAMS, MIN_STATS_INTERVAL_MS};

use crate::stats::{Bandwidth, Bitrate, RawStat, Resolution, StatsReport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("Peer connection is closed")]
    ConnectionClosed,

    #[error("Stats source error: {0}")]
    Source(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Monitoring stops once the connection reaches one of these states.
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

/// A live peer connection, as seen by the monitor.
#[async_trait]
pub trait StatsSource: Send + Sync + 'static {
    fn connection_state(&self) -> PeerState;

    /// Receiver notified on every connection state change.
    fn state_changes(&self) -> watch::Receiver<PeerState>;

    /// Current transport statistics.
    async fn snapshot(&self) -> Result<Vec<RawStat>, StatsError>;
}

type ReportCallback = Arc<dyn Fn(&StatsReport) + Send + Sync>;

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy)]
struct ByteCounter {
    bytes: u64,
    at: Instant,
}

/// Per-(stream, direction) byte counters carried between ticks.
#[derive(Debug, Default)]
pub(crate) struct Accumulator {
    counters: HashMap<(String, Direction), ByteCounter>,
    overflow_logged: bool,
}

impl Accumulator {
    pub(crate) fn tracked_streams(&self) -> usize {
        self.counters.len()
    }

    pub(crate) fn clear(&mut self) {
        self.counters.clear();
        self.overflow_logged = false;
    }

    /// Bits per second since the previous sample of this stream. The first
    /// sample of a stream counts as its own predecessor.
    fn bitrate(&mut self, stream: &str, direction: Direction, bytes: u64, now: Instant) -> f64 {
        let previous = self
            .counters
            .insert((stream.to_string(), direction), ByteCounter { bytes, at: now })
            .unwrap_or(ByteCounter { bytes, at: now });

        let elapsed = now.saturating_duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        // Counter resets (e.g. after an ICE restart) read as zero.
        bytes.saturating_sub(previous.bytes) as f64 * 8.0 / elapsed
    }

    pub(crate) fn reduce(&mut self, stats: &[RawStat], now: Instant) -> StatsReport {
        let mut bitrate = Bitrate::default();
        let mut packet_loss = 0.0;
        let mut jitter: f64 = 0.0;
        let mut rtt = 0.0;
        let mut available = 0.0;
        let mut resolution = None;
        let mut fps = None;
        let mut codec_id = None;

        for stat in stats {
            match stat.stat_type.as_str() {
                "inbound-rtp" => {
                    if let Some(bytes) = stat.bytes_received {
                        let rate = self.bitrate(&stat.id, Direction::Receive, bytes, now);
                        if stat.is_kind("video") {
                            bitrate.video.receive += rate;
                        } else if stat.is_kind("audio") {
                            bitrate.audio.receive += rate;
                        }
                    }
                    if let Some(lost) = stat.packets_lost {
                        packet_loss += lost.max(0) as f64;
                    }
                    if let Some(j) = stat.jitter {
                        jitter = jitter.max(j);
                    }
                    if stat.is_kind("video") {
                        if let (Some(width), Some(height)) = (stat.frame_width, stat.frame_height) {
                            resolution = Some(Resolution { width, height });
                        }
                        fps = stat.frames_per_second.or(fps);
                        codec_id = stat.codec_id.clone().or(codec_id);
                    }
                }
                "outbound-rtp" => {
                    if let Some(bytes) = stat.bytes_sent {
                        let rate = self.bitrate(&stat.id, Direction::Send, bytes, now);
                        if stat.is_kind("video") {
                            bitrate.video.send += rate;
                        } else if stat.is_kind("audio") {
                            bitrate.audio.send += rate;
                        }
                    }
                }
                "candidate-pair" if stat.succeeded() => {
                    if let Some(seconds) = stat.current_round_trip_time {
                        rtt = seconds * 1000.0;
                    }
                    if let Some(bps) = stat.available_outgoing_bitrate {
                        available = bps;
                    }
                }
                _ => {}
            }
        }

        let codec = codec_id.and_then(|id| {
            stats
                .iter()
                .find(|s| s.is_type("codec") && s.id == id)
                .and_then(|s| s.mime_type.clone())
        });

        self.prune(now);

        StatsReport {
            timestamp: Utc::now(),
            bandwidth: Bandwidth {
                available,
                used: bitrate.total(),
            },
            bitrate,
            packet_loss,
            jitter,
            rtt,
            resolution,
            fps,
            codec,
        }
    }

    /// Keep the counter map bounded by dropping streams absent from the
    /// latest snapshot. Live streams are never evicted; a snapshot with more
    /// than the limit is logged once until it shrinks again.
    fn prune(&mut self, now: Instant) {
        if self.counters.len() <= MAX_TRACKED_STREAMS {
            self.overflow_logged = false;
            return;
        }
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.at == now);
        debug!(
            dropped = before - self.counters.len(),
            tracked = self.counters.len(),
            "Pruned stale stream byte counters"
        );

        if self.counters.len() > MAX_TRACKED_STREAMS {
            if !self.overflow_logged {
                warn!(
                    live = self.counters.len(),
                    limit = MAX_TRACKED_STREAMS,
                    "More live streams than the tracking limit, keeping all"
                );
                self.overflow_logged = true;
            }
        } else {
            self.overflow_logged = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct StatsMonitor {
    source: Arc<dyn StatsSource>,
    callback: ReportCallback,
    accumulator: Arc<Mutex<Accumulator>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl StatsMonitor {
    /// Fails if the connection is already closed.
    pub fn new<F>(source: Arc<dyn StatsSource>, callback: F) -> Result<Self, StatsError>
    where
        F: Fn(&StatsReport) + Send + Sync + 'static,
    {
        if source.connection_state() == PeerState::Closed {
            return Err(StatsError::ConnectionClosed);
        }
        Ok(Self {
            source,
            callback: Arc::new(callback),
            accumulator: Arc::new(Mutex::new(Accumulator::default())),
            task: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Start polling every `interval` (at least one second).
    pub fn start(&self, interval: Duration) {
        let mut task = lock(&self.task);
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            warn!("Stats monitor already running");
            return;
        }

        let floor = Duration::from_millis(MIN_STATS_INTERVAL_MS);
        let interval = if interval < floor {
            warn!(
                requested_ms = interval.as_millis() as u64,
                floor_ms = MIN_STATS_INTERVAL_MS,
                "Stats interval below minimum, raising"
            );
            floor
        } else {
            interval
        };

        info!(interval_ms = interval.as_millis() as u64, "Stats monitor started");
        *task = Some(tokio::spawn(poll_loop(
            self.source.clone(),
            self.callback.clone(),
            self.accumulator.clone(),
            interval,
        )));
    }

    /// Stop polling and forget all per-stream counters.
    pub fn stop(&self) {
        let task = lock(&self.task).take();
        match task {
            Some(task) => {
                task.abort();
                info!("Stats monitor stopped");
            }
            None => debug!("Stats monitor not running"),
        }
        lock(&self.accumulator).clear();
    }
}

impl Drop for StatsMonitor {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

async fn poll_loop(
    source: Arc<dyn StatsSource>,
    callback: ReportCallback,
    accumulator: Arc<Mutex<Accumulator>>,
    interval: Duration,
) {
    let mut states = source.state_changes();
    let mut watching = true;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if source.connection_state().is_terminal() {
        info!(state = ?source.connection_state(), "Connection already ended, stats monitor stopping");
        lock(&accumulator).clear();
        return;
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = match source.snapshot().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        warn!(error = %e, "Failed to read connection stats");
                        continue;
                    }
                };

                let report = lock(&accumulator).reduce(&stats, Instant::now());
                if let Err(e) = report.validate() {
                    debug!(error = %e, "Dropping invalid stats report");
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(|| callback(&report))).is_err() {
                    error!("Stats callback panicked");
                }
            }
            changed = states.changed(), if watching => {
                if changed.is_err() {
                    // Source dropped its sender; keep polling without state updates.
                    watching = false;
                    continue;
                }
                let state = *states.borrow_and_update();
                if state.is_terminal() {
                    info!(state = ?state, "Connection ended, stats monitor stopping");
                    break;
                }
            }
        }
    }

    lock(&accumulator).clear();
}
