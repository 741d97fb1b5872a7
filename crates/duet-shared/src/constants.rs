/// Application name
pub const APP_NAME: &str = "Duet";

/// Maximum serialized signal size in bytes (64 KiB)
pub const MAX_SIGNAL_SIZE: usize = 64 * 1024;

/// Room identifier length bounds (characters)
pub const ROOM_ID_MIN_LEN: usize = 3;
pub const ROOM_ID_MAX_LEN: usize = 100;

/// Peer identifier length bounds (characters)
pub const PEER_ID_MIN_LEN: usize = 3;
pub const PEER_ID_MAX_LEN: usize = 50;

/// Signals allowed per rate-limit window
pub const MAX_SIGNALS_PER_MINUTE: u32 = 100;

/// Rate-limit window length in seconds
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Maximum number of signals held for retry
pub const RETRY_QUEUE_CAPACITY: usize = 100;

/// Presence heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Consecutive heartbeat failures tolerated before the connection is
/// flagged as possibly lost
pub const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// How long a relay selection stays cached, in seconds
pub const TURN_CACHE_TTL_SECS: u64 = 300;

/// Relay probe timeouts in milliseconds
pub const MIN_PROBE_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

/// Stats polling intervals in milliseconds
pub const MIN_STATS_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 2000;

/// Per-stream byte counters kept by the stats monitor before pruning
pub const MAX_TRACKED_STREAMS: usize = 50;

/// Auto-duck analysis cadence in milliseconds
pub const DUCK_TICK_MS: u64 = 100;

/// Average spectrum level (0-255 byte scale) above which the remote side
/// counts as speaking
pub const DUCK_THRESHOLD: f32 = 30.0;

/// Local gain applied while ducked
pub const DUCK_LEVEL: f32 = 0.2;

/// Local gain applied when not ducked
pub const RESTORE_LEVEL: f32 = 1.0;

/// Analyser FFT size in samples
pub const FFT_SIZE: usize = 256;

/// Positive jitter added to backoff delays, as a fraction of the delay
pub const BACKOFF_JITTER_RATIO: f64 = 0.1;

/// Backoff delays never exceed this fraction of the configured maximum
pub const BACKOFF_CEILING_RATIO: f64 = 0.9;
