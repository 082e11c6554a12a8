//! Pulse Call - P2P Audio/Video Call Sessions
//!
//! Baustein für direkte Calls zwischen zwei Teilnehmern mit:
//! - Zustandsmaschine pro Call (Ringing → Connecting → Connected → Ended)
//! - WebRTC für Audio/Video und ICE
//! - Signaling über einen WebSocket-Relay oder In-Process
//! - Lokaler Media-Verwaltung inkl. Mute, Video aus und Kamerawechsel

pub mod call_engine;
pub mod config;
pub mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use call_engine::{
    CameraFacing, CaptureDevice, EngineFactory, LocalMediaState, MediaError,
    PeerConnectionEngine, SilentCapture, WebRtcEngineFactory,
};
pub use config::{CallConfig, ConfigError};
pub use session::{
    CallDependencies, CallError, CallEvent, CallHandle, CallSession, CallSnapshot, CallStatus,
    Direction, EndReason,
};
pub use signaling::{
    Identity, IncomingCall, MemoryHub, SignalingChannel, SignalingClient, SignalingError,
};

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den globalen `tracing` Subscriber
///
/// Filter kommen aus `RUST_LOG`, ergänzt um Defaults für diese Crate und
/// ein leiseres webrtc. Weitere Aufrufe lassen den ersten Subscriber stehen.
pub fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["pulse_call=debug", "webrtc=warn"] {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Invalid log directive {}: {}", directive, e),
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Logging initialized");
    }
}
