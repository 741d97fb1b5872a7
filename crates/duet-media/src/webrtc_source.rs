//! [`StatsSource`] backed by a webrtc-rs peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::stats::RawStat;
use crate::stats_monitor::{PeerState, StatsError, StatsSource};

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
        }
    }
}

pub struct WebRtcStatsSource {
    peer: Arc<RTCPeerConnection>,
    state: watch::Sender<PeerState>,
}

impl WebRtcStatsSource {
    /// Wrap `peer`, installing its connection-state handler.
    ///
    /// webrtc-rs keeps a single state handler per connection, so this
    /// replaces any handler registered earlier.
    pub fn new(peer: Arc<RTCPeerConnection>) -> Arc<Self> {
        let (state, _) = watch::channel(PeerState::from(peer.connection_state()));
        let source = Arc::new(Self { peer, state });

        let notify = Arc::downgrade(&source);
        source
            .peer
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let notify = notify.clone();
                Box::pin(async move {
                    if let Some(source) = notify.upgrade() {
                        debug!(state = ?state, "Peer connection state changed");
                        source.state.send_replace(PeerState::from(state));
                    }
                })
            }));

        source
    }
}

#[async_trait]
impl StatsSource for WebRtcStatsSource {
    fn connection_state(&self) -> PeerState {
        PeerState::from(self.peer.connection_state())
    }

    fn state_changes(&self) -> watch::Receiver<PeerState> {
        self.state.subscribe()
    }

    async fn snapshot(&self) -> Result<Vec<RawStat>, StatsError> {
        let report = self.peer.get_stats().await;
        let value = serde_json::to_value(&report).map_err(|e| StatsError::Source(e.to_string()))?;
        Ok(RawStat::parse_report(value))
    }
}
