//! Local media capture and the track/stream handles shared by the session,
//! the peer transport, and the rendering layer.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::CaptureError;

/// Opus frame carrying 20 ms of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    /// Stopped by us. Does not count as the device going away.
    Stopped,
    /// Ended by the device or the remote side.
    Ended,
}

/// What feeds (or is fed by) a track.
#[derive(Clone)]
pub enum TrackSource {
    Local(Arc<TrackLocalStaticSample>),
    Remote(Arc<TrackRemote>),
    Detached,
}

/// Cheap-to-clone handle to one audio or video track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    state: watch::Sender<TrackState>,
    source: TrackSource,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                state,
                source,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> &TrackSource {
        &self.inner.source
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Subscribe to state changes (used to detect a revoked device).
    pub fn watch(&self) -> watch::Receiver<TrackState> {
        self.inner.state.subscribe()
    }

    /// Stop the track. Returns false if it was no longer live.
    pub fn stop(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Stopped;
                true
            } else {
                false
            }
        })
    }

    /// Mark the track as ended from the device side.
    pub fn end(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Ended;
                true
            } else {
                false
            }
        })
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// A group of tracks: the local capture, or everything received from the peer.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<Mutex<Vec<MediaTrack>>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_tracks(id, Vec::new())
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(Mutex::new(tracks)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_track(&self, track: MediaTrack) {
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(track);
    }

    /// Stop every track. Safe to call repeatedly.
    pub fn stop_all(&self) {
        for track in self.tracks() {
            if track.stop() {
                debug!(stream = %self.id, track = track.id(), "Track stopped");
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks().iter().any(MediaTrack::is_live)
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        if self.id != other.id {
            return false;
        }
        let ours: Vec<String> = self.tracks().iter().map(|t| t.id().to_string()).collect();
        let theirs: Vec<String> = other.tracks().iter().map(|t| t.id().to_string()).collect();
        ours == theirs
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Source of local audio/video. Acquisition may suspend (permission prompt).
#[async_trait]
pub trait MediaDevice: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, CaptureError>;
}

/// Device producing Opus silence and an idle VP8 track. Stands in for a
/// camera when the client runs headless.
pub struct SampleDevice {
    enabled: bool,
}

impl SampleDevice {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl MediaDevice for SampleDevice {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, CaptureError> {
        if !self.enabled {
            return Err(CaptureError::PermissionDenied(
                "media capture is disabled by configuration".to_string(),
            ));
        }
        if !constraints.audio && !constraints.video {
            return Err(CaptureError::DeviceUnavailable(
                "neither audio nor video requested".to_string(),
            ));
        }

        let stream_id = format!("local-{}", uuid::Uuid::new_v4());
        let mut tracks = Vec::new();

        if constraints.audio {
            let sample = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_string(),
                stream_id.clone(),
            ));
            let track = MediaTrack::new(
                format!("{stream_id}-audio"),
                TrackKind::Audio,
                TrackSource::Local(Arc::clone(&sample)),
            );
            spawn_silence(track.clone(), sample);
            tracks.push(track);
        }

        if constraints.video {
            let sample = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                stream_id.clone(),
            ));
            tracks.push(MediaTrack::new(
                format!("{stream_id}-video"),
                TrackKind::Video,
                TrackSource::Local(sample),
            ));
        }

        info!(stream = %stream_id, tracks = tracks.len(), "Local media acquired");
        Ok(MediaStream::with_tracks(stream_id, tracks))
    }
}

/// Feed Opus silence into `sample` until the track stops.
fn spawn_silence(track: MediaTrack, sample: Arc<TrackLocalStaticSample>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(AUDIO_FRAME);
        while track.is_live() {
            tick.tick().await;
            let frame = webrtc::media::Sample {
                data: bytes::Bytes::from_static(&OPUS_SILENCE),
                duration: AUDIO_FRAME,
                ..Default::default()
            };
            if let Err(e) = sample.write_sample(&frame).await {
                warn!(track = track.id(), "Failed to write audio sample: {e}");
                break;
            }
        }
        debug!(track = track.id(), "Silence feeder stopped");
    });
}
