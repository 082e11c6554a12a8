//! Call Engine Module - Peer Connection und lokale Media
//!
//! Dieses Modul verwaltet:
//! - Die Schnittstelle zur Peer Connection Engine (Offer/Answer, ICE, Tracks)
//! - Die WebRTC-Implementierung dieser Schnittstelle
//! - Lokale Audio/Video Capture inkl. Kamerawechsel
//! - Puffer für verfrühte ICE Candidates

mod candidates;
mod engine;
mod media;
mod webrtc_engine;

pub use candidates::PendingCandidateBuffer;
pub use engine::{
    ConnectionState, EngineError, EngineEvent, EngineEvents, EngineFactory, IceCandidate,
    PeerConnectionEngine, RemoteTrack, SdpKind, SessionDescription,
};
pub use media::{
    CameraFacing, CaptureDevice, LocalMediaState, LocalStream, LocalTrack, MediaController,
    MediaError, SilentCapture, TrackKind, SAMPLE_RATE, VIDEO_CLOCK_RATE,
};
pub use webrtc_engine::{WebRtcEngine, WebRtcEngineFactory};
