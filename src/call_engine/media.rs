//! Media Controller - Lokale Audio/Video Capture
//!
//! Verwaltet den lokalen Stream eines Calls:
//! - Capture starten und stoppen (Mikrofon + Kamera)
//! - Mute und Video an/aus ohne Renegotiation
//! - Kamerawechsel (front/back) mit Ersatz-Track
//!
//! Das eigentliche Capture-Backend steckt hinter `CaptureDevice`. Tracks
//! schreiben ihre Samples in einen `TrackLocalStaticSample`, der direkt an
//! die Peer Connection gehängt werden kann.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate für Audio (48kHz, Opus Standard)
pub const SAMPLE_RATE: u32 = 48000;

/// Clock Rate für Video (RTP Standard für VP8)
pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// Stream-ID unter der alle lokalen Tracks laufen
const LOCAL_STREAM_ID: &str = "pulse-local";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission to capture media was denied")]
    PermissionDenied,

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("No local media acquired")]
    NotAcquired,
}

// ============================================================================
// TYPES
// ============================================================================

/// Art eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Ausrichtung der Kamera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    #[default]
    Front,
    Back,
}

impl CameraFacing {
    pub fn opposite(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

/// Lokaler Media-Zustand, wird nur durch explizite User-Intents verändert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub active_camera: CameraFacing,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            active_camera: CameraFacing::Front,
        }
    }
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

struct TrackInner {
    id: String,
    kind: TrackKind,
    facing: Option<CameraFacing>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    sink: Arc<TrackLocalStaticSample>,
}

/// Handle auf einen laufenden Capture-Track
///
/// Clones teilen sich denselben Zustand. Das Capture-Backend prüft
/// `is_enabled()` vor jedem Frame und beendet sich bei `is_stopped()`.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, facing: Option<CameraFacing>) -> Self {
        let id = format!("{}-{}", kind_label(kind), uuid::Uuid::new_v4());
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };
        let sink = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            LOCAL_STREAM_ID.to_owned(),
        ));

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                facing,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                sink,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn facing(&self) -> Option<CameraFacing> {
        self.inner.facing
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stoppt den Capture; gibt `true` zurück wenn der Track noch lief
    pub fn stop(&self) -> bool {
        !self.inner.stopped.swap(true, Ordering::SeqCst)
    }

    /// Sample-Senke für die Peer Connection
    pub fn sink(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.sink)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("facing", &self.inner.facing)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

/// Lokaler Stream eines Calls (immer ein Audio- und ein Video-Track)
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub audio: LocalTrack,
    pub video: LocalTrack,
}

impl LocalStream {
    pub fn tracks(&self) -> [&LocalTrack; 2] {
        [&self.audio, &self.video]
    }
}

// ============================================================================
// CAPTURE DEVICE
// ============================================================================

/// Plattform-Backend für Mikrofon und Kamera
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Startet einen Capture; `facing` ist nur für Video gesetzt
    async fn open(
        &self,
        kind: TrackKind,
        facing: Option<CameraFacing>,
    ) -> Result<LocalTrack, MediaError>;
}

/// Capture ohne Hardware: liefert Tracks in die nie Samples geschrieben werden
///
/// Reicht um Signaling und ICE ohne Mikrofon/Kamera durchzuspielen.
#[derive(Debug, Default, Clone)]
pub struct SilentCapture;

#[async_trait]
impl CaptureDevice for SilentCapture {
    async fn open(
        &self,
        kind: TrackKind,
        facing: Option<CameraFacing>,
    ) -> Result<LocalTrack, MediaError> {
        Ok(LocalTrack::new(kind, facing))
    }
}

// ============================================================================
// MEDIA CONTROLLER
// ============================================================================

struct MediaInner {
    stream: Option<LocalStream>,
    state: LocalMediaState,
}

/// Besitzt den lokalen Stream eines Calls
///
/// Clones teilen sich den Zustand, damit laufende Acquisitions außerhalb
/// der Session abgeschlossen werden können.
#[derive(Clone)]
pub struct MediaController {
    device: Arc<dyn CaptureDevice>,
    inner: Arc<Mutex<MediaInner>>,
}

impl MediaController {
    pub fn new(device: Arc<dyn CaptureDevice>, initial: LocalMediaState) -> Self {
        Self {
            device,
            inner: Arc::new(Mutex::new(MediaInner {
                stream: None,
                state: initial,
            })),
        }
    }

    /// Startet Audio- und Video-Capture
    ///
    /// Ist bereits ein Stream vorhanden, wird dieser zurückgegeben.
    pub async fn acquire(&self, facing: CameraFacing) -> Result<LocalStream, MediaError> {
        let existing = self.inner.lock().stream.clone();
        if let Some(stream) = existing {
            return Ok(stream);
        }

        let audio = self.device.open(TrackKind::Audio, None).await?;
        let video = match self.device.open(TrackKind::Video, Some(facing)).await {
            Ok(video) => video,
            Err(e) => {
                audio.stop();
                return Err(e);
            }
        };

        let mut inner = self.inner.lock();
        audio.set_enabled(inner.state.audio_enabled);
        video.set_enabled(inner.state.video_enabled);
        inner.state.active_camera = facing;

        let stream = LocalStream { audio, video };
        inner.stream = Some(stream.clone());

        tracing::info!(
            "Local media acquired (audio: {}, video: {}, camera: {:?})",
            stream.audio.id(),
            stream.video.id(),
            facing
        );
        Ok(stream)
    }

    /// Stoppt alle Tracks; mehrfacher Aufruf ist ein No-op
    ///
    /// Gibt `true` zurück wenn tatsächlich etwas freigegeben wurde.
    pub fn release(&self) -> bool {
        let Some(stream) = self.inner.lock().stream.take() else {
            return false;
        };
        for track in stream.tracks() {
            track.stop();
        }
        tracing::info!("Local media released");
        true
    }

    pub fn is_acquired(&self) -> bool {
        self.inner.lock().stream.is_some()
    }

    pub fn state(&self) -> LocalMediaState {
        self.inner.lock().state
    }

    pub fn stream(&self) -> Option<LocalStream> {
        self.inner.lock().stream.clone()
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> LocalMediaState {
        let mut inner = self.inner.lock();
        inner.state.audio_enabled = enabled;
        if let Some(stream) = inner.stream.as_ref() {
            stream.audio.set_enabled(enabled);
        }
        inner.state
    }

    pub fn set_video_enabled(&self, enabled: bool) -> LocalMediaState {
        let mut inner = self.inner.lock();
        inner.state.video_enabled = enabled;
        if let Some(stream) = inner.stream.as_ref() {
            stream.video.set_enabled(enabled);
        }
        inner.state
    }

    /// Stoppt den aktuellen Video-Capture und startet einen neuen mit `facing`
    ///
    /// Der neue Track übernimmt den Enabled-Status des alten. Wurde der
    /// Stream während des Wechsels freigegeben, wird der neue Track sofort
    /// wieder gestoppt.
    pub async fn replace_video_track(&self, facing: CameraFacing) -> Result<LocalTrack, MediaError> {
        let previous = self
            .inner
            .lock()
            .stream
            .as_ref()
            .map(|stream| stream.video.clone())
            .ok_or(MediaError::NotAcquired)?;
        previous.stop();

        let track = self.device.open(TrackKind::Video, Some(facing)).await?;

        let mut inner = self.inner.lock();
        let enabled = inner.state.video_enabled;
        let Some(stream) = inner.stream.as_mut() else {
            track.stop();
            return Err(MediaError::NotAcquired);
        };
        track.set_enabled(enabled);
        stream.video = track.clone();
        inner.state.active_camera = facing;

        tracing::info!("Switched camera to {:?} ({})", facing, track.id());
        Ok(track)
    }
}

impl std::fmt::Debug for MediaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MediaController")
            .field("state", &inner.state)
            .field("acquired", &inner.stream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCapture;

    fn controller(capture: &Arc<MockCapture>) -> MediaController {
        MediaController::new(capture.clone(), LocalMediaState::default())
    }

    #[tokio::test]
    async fn test_acquire_opens_audio_and_video() {
        let capture = Arc::new(MockCapture::default());
        let media = controller(&capture);

        let stream = media.acquire(CameraFacing::Back).await.unwrap();

        assert_eq!(stream.audio.kind(), TrackKind::Audio);
        assert_eq!(stream.video.facing(), Some(CameraFacing::Back));
        assert_eq!(media.state().active_camera, CameraFacing::Back);
        assert_eq!(capture.open_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_failure_stops_partial_capture() {
        let capture = Arc::new(MockCapture::default());
        capture.fail_video_with(MediaError::DeviceUnavailable("camera busy".to_string()));
        let media = controller(&capture);

        let err = media.acquire(CameraFacing::Front).await.unwrap_err();

        assert_eq!(err, MediaError::DeviceUnavailable("camera busy".to_string()));
        assert!(!media.is_acquired());
        assert_eq!(capture.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let capture = Arc::new(MockCapture::default());
        let media = controller(&capture);
        media.acquire(CameraFacing::Front).await.unwrap();

        assert!(media.release());
        assert!(!media.release());
        assert_eq!(capture.live_tracks(), 0);
        assert_eq!(capture.stop_count(), 2);
    }

    #[tokio::test]
    async fn test_toggles_apply_to_tracks_and_survive_acquire() {
        let capture = Arc::new(MockCapture::default());
        let media = controller(&capture);

        // Mute vor dem Acquire wird auf den neuen Track übertragen
        media.set_audio_enabled(false);
        let stream = media.acquire(CameraFacing::Front).await.unwrap();
        assert!(!stream.audio.is_enabled());

        let state = media.set_video_enabled(false);
        assert!(!state.video_enabled);
        assert!(!stream.video.is_enabled());
    }

    #[tokio::test]
    async fn test_replace_video_track_swaps_camera() {
        let capture = Arc::new(MockCapture::default());
        let media = controller(&capture);
        let stream = media.acquire(CameraFacing::Front).await.unwrap();
        media.set_video_enabled(false);

        let track = media.replace_video_track(CameraFacing::Back).await.unwrap();

        assert!(stream.video.is_stopped());
        assert!(!track.is_enabled());
        assert_eq!(track.facing(), Some(CameraFacing::Back));
        assert_eq!(media.state().active_camera, CameraFacing::Back);
        assert_eq!(media.stream().unwrap().video.id(), track.id());
        assert!(!stream.audio.is_stopped());
    }

    #[tokio::test]
    async fn test_replace_without_stream_fails() {
        let capture = Arc::new(MockCapture::default());
        let media = controller(&capture);

        let err = media.replace_video_track(CameraFacing::Back).await.unwrap_err();
        assert_eq!(err, MediaError::NotAcquired);
    }

    #[test]
    fn test_camera_opposite() {
        assert_eq!(CameraFacing::Front.opposite(), CameraFacing::Back);
        assert_eq!(CameraFacing::Back.opposite(), CameraFacing::Front);
    }
}
