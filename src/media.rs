//! Local capture devices and tracks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::MediaError;
use crate::rtc::MediaKind;

/// A local capture track. `enabled` gates what is sent without touching
/// negotiation; `stop` releases the device for good.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Idempotent.
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

/// Plain [`MediaTrack`] backed by two flags.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for LocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Microphone always; camera only when video is wanted.
    pub fn for_call(wants_video: bool) -> Self {
        Self {
            audio: true,
            video: wants_video,
        }
    }
}

/// Tracks captured for one peer session.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub audio: Option<Arc<dyn MediaTrack>>,
    pub video: Option<Arc<dyn MediaTrack>>,
}

impl LocalStream {
    pub fn tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// A display capture. `ended` fires when the user stops sharing from the
/// system UI.
#[derive(Debug)]
pub struct DisplayCapture {
    pub track: Arc<dyn MediaTrack>,
    pub ended: oneshot::Receiver<()>,
}

/// Raw microphone access for voice activity detection. Frames are mono f32
/// samples in `-1.0..=1.0`.
#[derive(Debug)]
pub struct MicrophoneCapture {
    pub track: Arc<dyn MediaTrack>,
    pub frames: mpsc::Receiver<Vec<f32>>,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError>;

    async fn get_display_media(&self) -> Result<DisplayCapture, MediaError>;

    async fn open_microphone(&self) -> Result<MicrophoneCapture, MediaError>;
}
