//! Audio processing strategies for the ducker.
//!
//! [`GraphProcessor`] runs a small graph on tokio tasks:
//!
//! ```text
//! local  -> local gain  --------------> mix -> output
//! remote -> remote gain -> (analyser) -> mix
//! ```
//!
//! Local frames clock the output; the latest remote frame is mixed into
//! each one. [`PassThrough`] is used when no audio context is available and
//! hands the local stream back untouched.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::analyser::Analyser;
use crate::backend::AudioContext;
use crate::ducker::DuckerError;
use crate::mixer::mix_sources;
use crate::stream::{AudioFrame, AudioStream, FrameStream};

const OUTPUT_BUFFER: usize = 32;

/// Shared gain value, readable from the processing tasks.
#[derive(Debug, Clone)]
pub struct Gain(Arc<AtomicU32>);

impl Gain {
    pub fn new(level: f32) -> Self {
        Self(Arc::new(AtomicU32::new(level.to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub trait AudioProcessor: Send {
    fn kind(&self) -> &'static str;

    /// Stream to hand to the peer connection in place of the local one.
    fn output(&self) -> Arc<dyn AudioStream>;

    /// Analyser fed by the remote stream, if there is one.
    fn analyser(&self) -> Option<Arc<Mutex<Analyser>>>;

    /// Disconnect every node and close the context. Safe to repeat.
    fn teardown(&mut self);
}

// ---------------------------------------------------------------------------
// Pass-through
// ---------------------------------------------------------------------------

pub struct PassThrough {
    stream: Arc<dyn AudioStream>,
}

impl PassThrough {
    pub fn new(stream: Arc<dyn AudioStream>) -> Self {
        Self { stream }
    }
}

impl AudioProcessor for PassThrough {
    fn kind(&self) -> &'static str {
        "pass-through"
    }

    fn output(&self) -> Arc<dyn AudioStream> {
        self.stream.clone()
    }

    fn analyser(&self) -> Option<Arc<Mutex<Analyser>>> {
        None
    }

    fn teardown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

struct RemoteBranch {
    source: JoinHandle<()>,
    gain: Gain,
    analyser: Arc<Mutex<Analyser>>,
}

pub struct GraphProcessor {
    context: Option<AudioContext>,
    output: Arc<FrameStream>,
    local_source: Option<JoinHandle<()>>,
    remote: Option<RemoteBranch>,
}

impl GraphProcessor {
    /// Wire the graph and start its tasks. Must be called inside a tokio
    /// runtime. On error the context is closed.
    pub fn build(
        mut context: AudioContext,
        local: Arc<dyn AudioStream>,
        remote: Option<Arc<dyn AudioStream>>,
        local_gain: Gain,
        fft_size: usize,
    ) -> Result<Self, DuckerError> {
        // Remote first: if it fails, the local stream is still intact for
        // the caller's fallback.
        let claimed = remote
            .as_ref()
            .map(|stream| claim_frames(&**stream, "remote"))
            .transpose()
            .and_then(|remote_frames| {
                Ok((claim_frames(&*local, "local")?, remote_frames))
            });
        let (local_frames, remote_frames) = match claimed {
            Ok(frames) => frames,
            Err(e) => {
                if let Err(close) = context.close() {
                    warn!(error = %close, "Failed to close audio context");
                }
                return Err(e);
            }
        };

        let (output_tx, output) = FrameStream::channel(format!("{}-ducked", local.id()), OUTPUT_BUFFER);
        let pending: Arc<Mutex<Option<AudioFrame>>> = Arc::new(Mutex::new(None));

        let remote = remote_frames.map(|frames| {
            let gain = Gain::new(1.0);
            let analyser = Arc::new(Mutex::new(Analyser::new(fft_size)));
            let source = tokio::spawn(run_remote_source(frames, analyser.clone(), pending.clone()));
            RemoteBranch {
                source,
                gain,
                analyser,
            }
        });

        let mix_remote = remote.as_ref().map(|branch| (pending, branch.gain.clone()));
        let local_source = tokio::spawn(run_local_source(local_frames, local_gain, mix_remote, output_tx));

        debug!(
            sample_rate = context.config().sample_rate,
            remote = remote.is_some(),
            "Audio graph connected"
        );

        Ok(Self {
            context: Some(context),
            output: Arc::new(output),
            local_source: Some(local_source),
            remote,
        })
    }
}

fn claim_frames(
    stream: &dyn AudioStream,
    which: &'static str,
) -> Result<mpsc::Receiver<AudioFrame>, DuckerError> {
    stream.take_frames().ok_or(DuckerError::FramesClaimed(which))
}

impl AudioProcessor for GraphProcessor {
    fn kind(&self) -> &'static str {
        "graph"
    }

    fn output(&self) -> Arc<dyn AudioStream> {
        self.output.clone()
    }

    fn analyser(&self) -> Option<Arc<Mutex<Analyser>>> {
        self.remote.as_ref().map(|branch| branch.analyser.clone())
    }

    fn teardown(&mut self) {
        if let Some(source) = self.local_source.take() {
            source.abort();
            debug!("Local source disconnected");
        }
        if let Some(branch) = self.remote.take() {
            branch.source.abort();
            branch.gain.set(0.0);
            lock(&branch.analyser).reset();
            debug!("Remote source, gain and analyser disconnected");
        }
        if let Some(mut context) = self.context.take() {
            if context.is_open() {
                if let Err(e) = context.close() {
                    warn!(error = %e, "Failed to close audio context");
                }
            }
        }
    }
}

impl Drop for GraphProcessor {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run_local_source(
    mut frames: mpsc::Receiver<AudioFrame>,
    gain: Gain,
    remote: Option<(Arc<Mutex<Option<AudioFrame>>>, Gain)>,
    output: mpsc::Sender<AudioFrame>,
) {
    while let Some(frame) = frames.recv().await {
        let mixed = match &remote {
            Some((pending, remote_gain)) => {
                let remote_frame = lock(pending).take().unwrap_or_default();
                mix_sources(&[(&frame[..], gain.get()), (&remote_frame[..], remote_gain.get())])
            }
            None => mix_sources(&[(&frame[..], gain.get())]),
        };
        if output.send(mixed).await.is_err() {
            debug!("Ducked output dropped, stopping local source");
            break;
        }
    }
}

async fn run_remote_source(
    mut frames: mpsc::Receiver<AudioFrame>,
    analyser: Arc<Mutex<Analyser>>,
    pending: Arc<Mutex<Option<AudioFrame>>>,
) {
    while let Some(frame) = frames.recv().await {
        lock(&analyser).push_samples(&frame);
        *lock(&pending) = Some(frame);
    }
    debug!("Remote stream ended");
}
