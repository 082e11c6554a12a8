//! Zustände, Snapshots und Events einer Call Session

use crate::call_engine::{LocalMediaState, RemoteTrack};
use crate::signaling::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// CALL STATUS
// ============================================================================

/// Status eines Calls; `Ended` ist endgültig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Ausgehend: vor dem Wählen, eingehend: klingelt
    Ringing,
    /// Media steht, Offer/Answer läuft
    Connecting,
    Connected,
    Ended,
}

impl CallStatus {
    pub fn is_ended(self) -> bool {
        self == Self::Ended
    }
}

/// Rolle dieser Seite im Call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Wir rufen an und erzeugen das Offer
    Outgoing,
    /// Wir werden angerufen und antworten
    Incoming,
}

/// Warum ein Call beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    LocalReject,
    RemoteHangup,
    RemoteReject,
    MediaUnavailable,
    NegotiationFailed,
    SignalingFailed,
    Timeout,
}

// ============================================================================
// SNAPSHOT & EVENTS
// ============================================================================

/// Beobachtbarer Zustand für die UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub session_id: Uuid,
    pub local: Identity,
    pub remote: Identity,
    pub direction: Direction,
    pub status: CallStatus,
    pub duration_seconds: u64,
    pub media: LocalMediaState,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

/// Events die von einer Session ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StatusChanged(CallStatus),
    DurationChanged(u64),
    MediaStateChanged(LocalMediaState),
    RemoteStreamReady(RemoteTrack),
    Error(String),
}

// ============================================================================
// INTENTS
// ============================================================================

/// Aktionen der UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Initiate,
    Accept,
    Reject { reason: Option<String> },
    End,
    ToggleMute,
    ToggleVideo,
    SwitchCamera,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::Accept => "accept",
            Self::Reject { .. } => "reject",
            Self::End => "end",
            Self::ToggleMute => "toggle_mute",
            Self::ToggleVideo => "toggle_video",
            Self::SwitchCamera => "switch_camera",
        }
    }

    /// Intents deren Ergebnis erst nach einer asynchronen Operation feststeht
    pub(crate) fn is_deferred(&self) -> bool {
        matches!(self, Self::Initiate | Self::Accept | Self::SwitchCamera)
    }
}
