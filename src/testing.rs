//! Skriptbare Kollaborateure für Tests

use crate::call_engine::{
    CameraFacing, CaptureDevice, EngineError, EngineEvent, EngineEvents, EngineFactory,
    IceCandidate, LocalTrack, MediaError, PeerConnectionEngine, SdpKind, SessionDescription,
    TrackKind,
};
use crate::config::CallConfig;
use crate::session::{CallDependencies, CallHandle, CallSession};
use crate::signaling::{Identity, MemoryHub, MemorySignaling, SignalingChannel, SignalingMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

// ============================================================================
// MOCK ENGINE
// ============================================================================

/// Aufruf einer `MockEngine`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SdpKind),
    SetRemoteDescription(SdpKind),
    AddIceCandidate(String),
    AddTrack(TrackKind),
    ReplaceTrack(TrackKind, Option<CameraFacing>),
    Close,
}

/// Zeichnet alle Aufrufe in Reihenfolge auf
pub struct MockEngine {
    calls: Mutex<Vec<EngineCall>>,
    events: EngineEvents,
    fail_remote_description: Mutex<Option<EngineError>>,
    close_delay: Option<Duration>,
}

impl MockEngine {
    fn new(events: EngineEvents, close_delay: Option<Duration>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            events,
            fail_remote_description: Mutex::new(None),
            close_delay,
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// Simuliert einen Engine-Callback
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EngineCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| **call == EngineCall::Close)
            .count()
    }

    pub fn fail_remote_description_with(&self, error: EngineError) {
        *self.fail_remote_description.lock() = Some(error);
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerConnectionEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateOffer);
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetLocalDescription(description.kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        if let Some(error) = self.fail_remote_description.lock().take() {
            return Err(error);
        }
        self.record(EngineCall::SetRemoteDescription(description.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(EngineCall::AddIceCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), EngineError> {
        self.record(EngineCall::AddTrack(track.kind()));
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<(), EngineError> {
        self.record(EngineCall::ReplaceTrack(kind, track.facing()));
        Ok(())
    }

    async fn close(&self) {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(EngineCall::Close);
    }
}

#[derive(Default)]
pub struct MockEngineFactory {
    engines: Mutex<Vec<Arc<MockEngine>>>,
    fail_with: Mutex<Option<EngineError>>,
    close_delay: Mutex<Option<Duration>>,
}

impl MockEngineFactory {
    /// Zuletzt erzeugte Engine
    pub fn last(&self) -> Option<Arc<MockEngine>> {
        self.engines.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn fail_with(&self, error: EngineError) {
        *self.fail_with.lock() = Some(error);
    }

    /// Neue Engines brauchen `delay` für `close()`
    pub fn close_after(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        events: EngineEvents,
    ) -> Result<Arc<dyn PeerConnectionEngine>, EngineError> {
        if let Some(error) = self.fail_with.lock().clone() {
            return Err(error);
        }
        let engine = Arc::new(MockEngine::new(events, *self.close_delay.lock()));
        self.engines.lock().push(Arc::clone(&engine));
        Ok(engine)
    }
}

// ============================================================================
// MOCK CAPTURE
// ============================================================================

/// Capture ohne Hardware, zählt geöffnete und gestoppte Tracks
#[derive(Default)]
pub struct MockCapture {
    opened: Mutex<Vec<LocalTrack>>,
    fail_all: Mutex<Option<MediaError>>,
    fail_video: Mutex<Option<MediaError>>,
    fail_facing: Mutex<Option<(CameraFacing, MediaError)>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockCapture {
    /// Anzahl erfolgreich geöffneter Tracks
    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn live_tracks(&self) -> usize {
        self.opened.lock().iter().filter(|t| !t.is_stopped()).count()
    }

    pub fn stop_count(&self) -> usize {
        self.opened.lock().iter().filter(|t| t.is_stopped()).count()
    }

    pub fn fail_with(&self, error: MediaError) {
        *self.fail_all.lock() = Some(error);
    }

    pub fn fail_video_with(&self, error: MediaError) {
        *self.fail_video.lock() = Some(error);
    }

    pub fn fail_facing_with(&self, facing: CameraFacing, error: MediaError) {
        *self.fail_facing.lock() = Some((facing, error));
    }

    /// Hält das nächste `open` an, bis der zurückgegebene Sender feuert
    pub fn hold(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }
}

#[async_trait]
impl CaptureDevice for MockCapture {
    async fn open(
        &self,
        kind: TrackKind,
        facing: Option<CameraFacing>,
    ) -> Result<LocalTrack, MediaError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if let Some(error) = self.fail_all.lock().clone() {
            return Err(error);
        }
        if kind == TrackKind::Video {
            if let Some(error) = self.fail_video.lock().clone() {
                return Err(error);
            }
            if let Some((failing, error)) = self.fail_facing.lock().clone() {
                if facing == Some(failing) {
                    return Err(error);
                }
            }
        }

        let track = LocalTrack::new(kind, facing);
        self.opened.lock().push(track.clone());
        Ok(track)
    }
}

// ============================================================================
// CALL HARNESS
// ============================================================================

/// Zwei Endpoints an einem Hub; `local` gehört zur Session unter Test
pub struct CallHarness {
    pub local: MemorySignaling,
    pub peer: MemorySignaling,
    pub engines: Arc<MockEngineFactory>,
    pub capture: Arc<MockCapture>,
    pub config: CallConfig,
}

impl CallHarness {
    pub fn new() -> Self {
        let hub = MemoryHub::new();
        let local = hub.endpoint("alice");
        let peer = hub.endpoint("bob");

        Self {
            local,
            peer,
            engines: Arc::new(MockEngineFactory::default()),
            capture: Arc::new(MockCapture::default()),
            config: CallConfig::default(),
        }
    }

    pub fn deps(&self) -> CallDependencies {
        CallDependencies {
            channel: Arc::new(self.local.clone()),
            engines: self.engines.clone(),
            capture: self.capture.clone(),
            config: self.config.clone(),
        }
    }

    /// Abhängigkeiten für eine Session auf der Gegenseite
    pub fn peer_deps(
        &self,
        engines: Arc<MockEngineFactory>,
        capture: Arc<MockCapture>,
    ) -> CallDependencies {
        CallDependencies {
            channel: Arc::new(self.peer.clone()),
            engines,
            capture,
            config: self.config.clone(),
        }
    }

    pub fn peer_identity(&self) -> Identity {
        self.peer.local_identity()
    }

    pub fn outgoing(&self) -> (CallSession, CallHandle) {
        CallSession::outgoing(self.peer_identity(), self.deps())
    }

    /// Gegenseite ruft an
    pub async fn incoming(&self) -> (CallSession, CallHandle) {
        let mut calls = self.local.incoming_calls();
        self.peer
            .send(&self.local.local_identity(), SignalingMessage::Initiate)
            .await
            .unwrap();
        let call = calls.try_recv().unwrap();
        CallSession::incoming(call, self.deps())
    }

    /// Nachricht der Gegenseite an die Session unter Test
    pub async fn from_peer(&self, message: SignalingMessage) {
        self.peer
            .send(&self.local.local_identity(), message)
            .await
            .unwrap();
    }

    /// Von der Session unter Test gesendete Nachrichten
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.local
            .sent_messages()
            .into_iter()
            .map(|(_, message)| message)
            .collect()
    }

    pub fn engine(&self) -> Arc<MockEngine> {
        self.engines.last().expect("no engine created yet")
    }
}
