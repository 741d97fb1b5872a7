//! # duet-node
//!
//! One participant of a two-peer call, run from the command line.
//!
//! The node:
//! - picks the lowest-latency **relay** from the configured STUN/TURN set
//! - joins the room over the **signaling store** (REST or in-process)
//! - logs incoming signals and peer presence
//! - samples **connection statistics** from a peer connection using the
//!   selected relay
//! - leaves the room cleanly on Ctrl+C

mod config;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;

use duet_media::{StatsMonitor, StatsSource, WebRtcStatsSource};
use duet_net::{MemoryStore, RestStore, SendOutcome, SignalStore, SignalingClient, TurnSelector};
use duet_shared::constants::APP_NAME;
use duet_shared::types::SignalType;

use crate::config::{NodeConfig, StoreKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,duet_net=debug,duet_media=info")),
        )
        .init();

    info!("Starting {} node v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(
        store = %config.store,
        room = %config.signaling.room_id,
        user = %config.signaling.user_id,
        relays = config.relay.servers.len(),
        stats_interval_ms = config.stats_interval.as_millis() as u64,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Relay selection
    // -----------------------------------------------------------------------
    let selector = TurnSelector::new(config.relay.servers.clone(), config.relay.probe_timeout)?;
    let relay = selector.select_optimal_server().await;
    info!(
        urls = ?relay.urls,
        latency_ms = selector.cached_latency().map(|l| l.as_millis() as u64),
        "Relay selected"
    );
    match selector.get_next_fallback(&relay) {
        Some(fallback) => info!(urls = ?fallback.urls, "Fallback relay"),
        None => warn!("No fallback relay configured"),
    }

    // -----------------------------------------------------------------------
    // 4. Signaling
    // -----------------------------------------------------------------------
    let store: Arc<dyn SignalStore> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Rest => Arc::new(RestStore::new(
            &config.signaling.endpoint,
            config.signaling.api_key.clone(),
        )?),
    };
    let client = SignalingClient::new(config.signaling.clone(), store)?;

    let signal_observer = client.on_signal(|signal| {
        info!(from = %signal.from, kind = %signal.kind, "Signal received");
    });
    let presence_observer = client.on_presence(|event| {
        info!(user = %event.user_id, status = ?event.status, "Peer presence changed");
    });

    client.connect().await?;

    if let Some(peer) = &config.peer_id {
        let request = serde_json::json!({ "reason": "node-start" });
        match client.send_signal(peer, SignalType::Renegotiate, request).await {
            Ok(SendOutcome::Sent) => info!(peer = %peer, "Renegotiation requested"),
            Ok(outcome) => warn!(peer = %peer, ?outcome, "Renegotiation request not sent yet"),
            Err(e) => error!(peer = %peer, error = %e, "Renegotiation request failed"),
        }
    }

    // -----------------------------------------------------------------------
    // 5. Connection statistics
    // -----------------------------------------------------------------------
    let api = APIBuilder::new().build();
    let peer = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers: vec![relay.to_ice_server()],
            ..Default::default()
        })
        .await?,
    );
    let source: Arc<dyn StatsSource> = WebRtcStatsSource::new(peer.clone());
    let monitor = StatsMonitor::new(source, |report| {
        info!(
            bitrate = report.bitrate.total(),
            packet_loss = report.packet_loss,
            jitter = report.jitter,
            rtt_ms = report.rtt,
            "Connection stats"
        );
    })?;
    monitor.start(config.stats_interval);

    // -----------------------------------------------------------------------
    // 6. Run until Ctrl+C, then leave the room
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    monitor.stop();
    if let Err(e) = peer.close().await {
        warn!(error = %e, "Failed to close peer connection");
    }

    let state = client.connection_state();
    if state.queued_signals > 0 {
        warn!(queued = state.queued_signals, "Leaving with undelivered signals");
    }
    signal_observer.unsubscribe();
    presence_observer.unsubscribe();
    client.disconnect().await;

    Ok(())
}
