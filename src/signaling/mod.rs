//! Signaling Module - Nachrichtenaustausch zwischen zwei Teilnehmern
//!
//! Dieses Modul verwaltet:
//! - Den Nachrichtentyp zwischen Anrufer und Angerufenem
//! - Identity-bezogene Subscriptions und die Queue eingehender Anrufe
//! - Den WebSocket Client zum Relay-Server
//! - Einen In-Process Hub für lokale Endpoints

mod channel;
mod client;
mod messages;

pub use channel::{
    IncomingCall, IncomingCalls, MemoryHub, MemorySignaling, SignalingChannel, SignalingRouter,
    Subscription,
};
pub use client::{websocket_url, ConnectionEvent, SignalingClient, SignalingError};
pub use messages::*;
