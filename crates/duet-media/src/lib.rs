//! # duet-media
//!
//! Media-side helpers for a peer call:
//! - [`AudioDucker`]: lowers the local microphone while the remote side speaks
//! - [`StatsMonitor`]: periodic connection statistics from a peer connection

pub mod analyser;
pub mod backend;
pub mod ducker;
pub mod graph;
pub mod mixer;
pub mod stats;
pub mod stats_monitor;
pub mod stream;
pub mod webrtc_source;

pub use analyser::Analyser;
pub use backend::{AudioBackend, AudioConfig, AudioContext, AudioError, CpalBackend, HeadlessBackend, NullBackend};
pub use ducker::{AudioDucker, DuckController, DuckSettings, DuckTransition, DuckerError, DuckerState};
pub use graph::{AudioProcessor, Gain, GraphProcessor, PassThrough};
pub use stats::{Bandwidth, Bitrate, Directional, RawStat, Resolution, StatsReport};
pub use stats_monitor::{PeerState, StatsError, StatsMonitor, StatsSource};
pub use stream::{AudioFrame, AudioStream, AudioTrack, FrameStream};
pub use webrtc_source::WebRtcStatsSource;
