//! Message Types für das Signaling-Protokoll
//!
//! `SignalingMessage` ist die Nachricht zwischen zwei Call-Teilnehmern.
//! `ClientMessage`/`ServerMessage` bilden das JSON-Protokoll zum Relay-Server,
//! das diese Nachrichten transportiert.

use crate::call_engine::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

// ============================================================================
// IDENTITY
// ============================================================================

/// Opake ID eines Teilnehmers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Identity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// PEER TO PEER MESSAGES
// ============================================================================

/// Nachrichten zwischen Anrufer und Angerufenem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Anruf beginnt, Gegenseite soll klingeln
    Initiate,
    Offer {
        description: SessionDescription,
    },
    Answer {
        description: SessionDescription,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    /// Angerufener hat angenommen und ist bereit für das Offer
    Accept,
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    End,
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Accept => "accept",
            Self::Reject { .. } => "reject",
            Self::End => "end",
        }
    }
}

/// Eingehende Nachricht mit Absender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub from: Identity,
    pub message: SignalingMessage,
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Anmeldung der eigenen Identity beim Relay
    Register { identity: Identity, timestamp: i64 },

    /// Nachricht an einen anderen Teilnehmer
    Signal {
        from: Identity,
        to: Identity,
        payload: SignalingMessage,
        timestamp: i64,
    },

    Heartbeat { identity: Identity, timestamp: i64 },
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Erfolgreiche Registrierung
    Registered {
        identity: Identity,
        #[serde(default)]
        timestamp: i64,
    },

    /// Weitergeleitete Nachricht eines Teilnehmers
    Signal {
        from: Identity,
        payload: SignalingMessage,
        #[serde(default)]
        timestamp: i64,
    },

    /// Fehler
    Error {
        code: i32,
        message: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Heartbeat Antwort
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
}
