//! Loopback-Demo: zwei Sessions im selben Prozess
//!
//! Ruft über einen In-Process Hub von "alice" bei "bob" an, baut echte
//! WebRTC Peer Connections mit stillen Tracks auf, hält den Call ein paar
//! Sekunden und legt wieder auf.
//!
//! Aufruf: `pulse-loopback [sekunden]`

use anyhow::Context;
use pulse_call::signaling::MemorySignaling;
use pulse_call::{
    CallConfig, CallDependencies, CallSession, CallStatus, MemoryHub, SignalingChannel,
    SilentCapture, WebRtcEngineFactory,
};
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pulse_call::init_logging();

    let hold_secs: u64 = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("invalid duration '{}'", arg))?,
        None => 3,
    };

    let config = CallConfig::from_env()?;
    let engines = Arc::new(WebRtcEngineFactory::new(&config));
    let capture = Arc::new(SilentCapture);
    let deps = |channel: MemorySignaling| CallDependencies {
        channel: Arc::new(channel),
        engines: engines.clone(),
        capture: capture.clone(),
        config: config.clone(),
    };

    let hub = MemoryHub::new();
    let alice = hub.endpoint("alice");
    let bob = hub.endpoint("bob");
    let mut incoming = bob.incoming_calls();

    let (caller, caller_handle) = CallSession::outgoing(bob.local_identity(), deps(alice));
    caller.spawn();
    caller_handle.initiate().await?;

    let call = incoming
        .recv()
        .await
        .context("incoming call queue closed")?;
    tracing::info!("bob: incoming call from {}", call.from);

    let (callee, callee_handle) = CallSession::incoming(call, deps(bob));
    callee.spawn();
    callee_handle.accept().await?;

    tokio::time::timeout(
        CONNECT_TIMEOUT,
        caller_handle.wait_for_status(CallStatus::Connected),
    )
    .await
    .context("peers did not connect in time")??;
    tracing::info!("Call connected, holding for {}s", hold_secs);

    tokio::time::sleep(Duration::from_secs(hold_secs)).await;
    let snapshot = caller_handle.snapshot();
    tracing::info!(
        "Duration {}s, media {:?}",
        snapshot.duration_seconds,
        snapshot.media
    );

    caller_handle.end().await?;
    let ended = callee_handle.wait_for_status(CallStatus::Ended).await?;
    tracing::info!("bob: call ended ({:?})", ended.end_reason);

    Ok(())
}
