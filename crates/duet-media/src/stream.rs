//! Media stream handles consumed by the audio pipeline.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// Mono PCM frame, f32 samples in [-1, 1].
pub type AudioFrame = Vec<f32>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub id: String,
    pub label: String,
    pub enabled: bool,
}

/// Anything the ducker can take audio from or hand audio back as.
///
/// Track enumeration is the capability a stream must expose; frames are
/// claimed once by whichever component consumes the stream.
pub trait AudioStream: Send + Sync {
    fn id(&self) -> &str;

    fn audio_tracks(&self) -> Vec<AudioTrack>;

    /// Take the frame receiver. `None` once it has been claimed.
    fn take_frames(&self) -> Option<mpsc::Receiver<AudioFrame>>;
}

/// Channel-backed [`AudioStream`].
pub struct FrameStream {
    id: String,
    tracks: Vec<AudioTrack>,
    frames: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
}

impl FrameStream {
    pub fn new(id: impl Into<String>, tracks: Vec<AudioTrack>, frames: mpsc::Receiver<AudioFrame>) -> Self {
        Self {
            id: id.into(),
            tracks,
            frames: Mutex::new(Some(frames)),
        }
    }

    /// A single-track stream plus the sender feeding it.
    pub fn channel(id: impl Into<String>, capacity: usize) -> (mpsc::Sender<AudioFrame>, Self) {
        let id = id.into();
        let (tx, rx) = mpsc::channel(capacity);
        let track = AudioTrack {
            id: format!("{id}-audio"),
            label: id.clone(),
            enabled: true,
        };
        (tx, Self::new(id, vec![track], rx))
    }
}

impl AudioStream for FrameStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn audio_tracks(&self) -> Vec<AudioTrack> {
        self.tracks.clone()
    }

    fn take_frames(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl std::fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_claimed_once() {
        let (tx, stream) = FrameStream::channel("mic", 4);
        assert_eq!(stream.audio_tracks().len(), 1);

        let mut rx = stream.take_frames().unwrap();
        assert!(stream.take_frames().is_none());

        tx.send(vec![0.25; 4]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![0.25; 4]);
    }
}
