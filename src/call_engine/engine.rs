//! Peer Connection Engine - Schnittstelle zur Media/ICE-Engine
//!
//! Die Call Session spricht ausschließlich über den `PeerConnectionEngine`
//! Trait mit der eigentlichen Engine. Callbacks der Engine (ICE Candidates,
//! eingehende Tracks, Connection State) werden nicht als Closures registriert,
//! sondern als `EngineEvent` in die Event-Queue der Session geschrieben.

use super::media::{LocalTrack, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer connection is closed")]
    Closed,
}

// ============================================================================
// SESSION DESCRIPTION & ICE
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session Description (Offer vom Anrufer, Answer vom Angerufenen)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate wie er über das Signaling verschickt wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// ENGINE EVENTS
// ============================================================================

/// Verbindungsstatus der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Eingehender Track der Gegenseite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Events die von der Engine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    ConnectionState(ConnectionState),
}

/// Sender über den eine Engine ihre Events an die Session liefert
pub type EngineEvents = mpsc::UnboundedSender<EngineEvent>;

// ============================================================================
// ENGINE TRAITS
// ============================================================================

/// Minimaler Operationssatz den die Session von einer Engine benötigt
#[async_trait]
pub trait PeerConnectionEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), EngineError>;

    /// Ersetzt den ausgehenden Track einer Art ohne Renegotiation
    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<(), EngineError>;

    async fn close(&self);
}

/// Erzeugt pro Call genau eine Engine-Instanz
///
/// `events` ist die Queue der Session, in die alle Callbacks der neuen
/// Engine geschrieben werden.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        events: EngineEvents,
    ) -> Result<Arc<dyn PeerConnectionEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_json_matches_browser_format() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn test_candidate_parses_without_optional_fields() {
        let candidate: IceCandidate =
            serde_json::from_str(r#"{"candidate":"candidate:2 1 udp 1 1.2.3.4 9 typ srflx"}"#)
                .unwrap();
        assert_eq!(candidate.sdp_mid, None);
        assert_eq!(candidate.sdp_mline_index, None);
    }

    #[test]
    fn test_description_constructors() {
        assert_eq!(SessionDescription::offer("v=0").kind, SdpKind::Offer);
        assert_eq!(SessionDescription::answer("v=0").kind, SdpKind::Answer);
    }
}
