//! Session Module - Zustandsmaschine eines Peer-to-Peer Calls
//!
//! Dieses Modul verwaltet:
//! - Den Ablauf eines Calls von Ringing bis Ended
//! - Die Gesprächsdauer
//! - Den Handle über den die UI Intents schickt und Zustand beobachtet

mod call;
mod handle;
mod state;
mod timer;

pub use call::{CallDependencies, CallError, CallSession};
pub use handle::CallHandle;
pub use state::{CallEvent, CallSnapshot, CallStatus, Direction, EndReason, Intent};
pub use timer::{CallTimer, TimerError};
