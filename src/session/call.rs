//! Call Session - Zustandsmaschine eines einzelnen Calls
//!
//! Eine Session besitzt exklusiv den lokalen Stream und die Engine-Instanz
//! eines Call-Versuchs. Alle Eingänge (UI-Intents, Signaling-Nachrichten,
//! Engine-Events, abgeschlossene Media/Engine-Operationen) laufen über einen
//! einzigen Dispatcher, Übergänge passieren also nie nebenläufig.
//!
//! Rollen:
//! - Anrufer: `initiate()` → Media + Engine → `Initiate` senden → `Connecting`,
//!   Offer sobald die Gegenseite `Accept` geschickt hat
//! - Angerufener: `accept()` → Media + Engine → `Accept` senden → `Connecting`,
//!   auf das Offer folgt das Answer

use super::handle::{CallHandle, IntentRequest};
use super::state::{CallEvent, CallSnapshot, CallStatus, Direction, EndReason, Intent};
use super::timer::CallTimer;
use crate::call_engine::{
    CameraFacing, CaptureDevice, ConnectionState, EngineError, EngineEvent, EngineEvents,
    EngineFactory, IceCandidate, LocalMediaState, MediaController, MediaError,
    PeerConnectionEngine, PendingCandidateBuffer, SessionDescription, TrackKind,
};
use crate::config::CallConfig;
use crate::signaling::{
    Identity, Inbound, IncomingCall, SignalingChannel, SignalingError, SignalingMessage,
    Subscription,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval};
use tracing::Instrument;
use uuid::Uuid;

/// Takt des Gesprächs-Timers
const TICK: Duration = Duration::from_secs(1);

/// Puffer für noch nicht verarbeitete Intents
const INTENT_QUEUE: usize = 16;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(#[from] MediaError),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Cannot {intent} while {status:?}")]
    InvalidState {
        intent: &'static str,
        status: CallStatus,
    },

    #[error("Call session is closed")]
    SessionClosed,
}

impl From<EngineError> for CallError {
    fn from(e: EngineError) -> Self {
        Self::NegotiationFailed(e.to_string())
    }
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Kollaborateure einer Session
#[derive(Clone)]
pub struct CallDependencies {
    pub channel: Arc<dyn SignalingChannel>,
    pub engines: Arc<dyn EngineFactory>,
    pub capture: Arc<dyn CaptureDevice>,
    pub config: CallConfig,
}

// ============================================================================
// IN-FLIGHT OPERATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Prepare,
    CameraSwitch,
}

enum CameraOutcome {
    Switched(CameraFacing),
    /// Neue Kamera fehlgeschlagen, vorherige läuft wieder
    Restored(CallError),
    /// Auch die vorherige Kamera ließ sich nicht wieder starten
    VideoLost(CallError),
}

enum Completion {
    Prepared(Result<Arc<dyn PeerConnectionEngine>, CallError>),
    CameraSwitched(CameraOutcome),
}

/// Lokale Media starten und die Engine mit beiden Tracks aufsetzen
async fn prepare(
    media: MediaController,
    engines: Arc<dyn EngineFactory>,
    events: EngineEvents,
    facing: CameraFacing,
) -> Result<Arc<dyn PeerConnectionEngine>, CallError> {
    let stream = media.acquire(facing).await?;

    let engine = match engines.create(events).await {
        Ok(engine) => engine,
        Err(e) => {
            media.release();
            return Err(e.into());
        }
    };

    for track in stream.tracks() {
        if let Err(e) = engine.add_track(track).await {
            engine.close().await;
            media.release();
            return Err(e.into());
        }
    }

    Ok(engine)
}

async fn replace_camera(
    media: &MediaController,
    engine: &Arc<dyn PeerConnectionEngine>,
    facing: CameraFacing,
) -> Result<(), CallError> {
    let track = media.replace_video_track(facing).await?;
    engine.replace_track(TrackKind::Video, &track).await?;
    Ok(())
}

async fn run_camera_switch(
    media: MediaController,
    engine: Arc<dyn PeerConnectionEngine>,
    previous: CameraFacing,
) -> CameraOutcome {
    let target = previous.opposite();
    let error = match replace_camera(&media, &engine, target).await {
        Ok(()) => return CameraOutcome::Switched(target),
        Err(e) => e,
    };

    tracing::warn!("Switching camera to {:?} failed: {}", target, error);
    match replace_camera(&media, &engine, previous).await {
        Ok(()) => CameraOutcome::Restored(error),
        Err(e) => {
            tracing::error!("Restoring {:?} camera failed: {}", previous, e);
            CameraOutcome::VideoLost(error)
        }
    }
}

async fn next_inbound(subscription: &mut Option<Subscription>) -> Option<Inbound> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Call-Versuch zwischen genau zwei Identities
pub struct CallSession {
    id: Uuid,
    local: Identity,
    remote: Identity,
    direction: Direction,
    status: CallStatus,

    channel: Arc<dyn SignalingChannel>,
    engines: Arc<dyn EngineFactory>,
    media: MediaController,
    engine: Option<Arc<dyn PeerConnectionEngine>>,
    subscription: Option<Subscription>,

    candidates: PendingCandidateBuffer,
    has_remote_description: bool,
    /// Gegenseite weiß von diesem Call (Initiate gesendet bzw. empfangen)
    announced: bool,
    remote_accepted: bool,
    offer_sent: bool,

    pending: Option<PendingOp>,
    op_reply: Option<oneshot::Sender<Result<(), CallError>>>,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,

    timer: CallTimer,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
    ring_deadline: Option<Instant>,

    engine_tx: EngineEvents,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    intents: mpsc::Receiver<IntentRequest>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallSession {
    /// Neuer ausgehender Call, wartet auf `initiate()`
    pub fn outgoing(remote: impl Into<Identity>, deps: CallDependencies) -> (Self, CallHandle) {
        Self::new(Direction::Outgoing, remote.into(), deps)
    }

    /// Session für einen eingehenden Anruf, klingelt sofort
    ///
    /// Hat der Anrufer schon vor dem Abonnieren aufgelegt, startet die
    /// Session direkt als `Ended`.
    pub fn incoming(call: IncomingCall, deps: CallDependencies) -> (Self, CallHandle) {
        tracing::info!("Incoming call from {}", call.from);
        let (mut session, handle) = Self::new(Direction::Incoming, call.from.clone(), deps);

        // Erst nach dem Abonnieren prüfen, spätere Nachrichten kommen über die Subscription
        if call.is_cancelled() {
            tracing::info!("{} hung up before the call was picked up", session.remote);
            session.mark_ended(EndReason::RemoteHangup);
            session.subscription = None;
            session.publish();
        }
        (session, handle)
    }

    fn new(direction: Direction, remote: Identity, deps: CallDependencies) -> (Self, CallHandle) {
        let CallDependencies {
            channel,
            engines,
            capture,
            config,
        } = deps;

        let id = Uuid::new_v4();
        let local = channel.local_identity();
        let subscription = channel.subscribe(&remote);
        let media = MediaController::new(
            capture,
            LocalMediaState {
                audio_enabled: true,
                video_enabled: config.start_with_video,
                active_camera: config.default_camera,
            },
        );

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (intent_tx, intents) = mpsc::channel(INTENT_QUEUE);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let started_at = Utc::now();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot {
            session_id: id,
            local: local.clone(),
            remote: remote.clone(),
            direction,
            status: CallStatus::Ringing,
            duration_seconds: 0,
            media: media.state(),
            started_at,
            connected_at: None,
            ended_at: None,
            end_reason: None,
        });

        let handle = CallHandle::new(id, remote.clone(), intent_tx, snapshot_rx, event_tx.clone());

        let session = Self {
            id,
            local,
            remote,
            direction,
            status: CallStatus::Ringing,
            channel,
            engines,
            media,
            engine: None,
            subscription: Some(subscription),
            candidates: PendingCandidateBuffer::new(),
            has_remote_description: false,
            announced: direction == Direction::Incoming,
            remote_accepted: false,
            offer_sent: false,
            pending: None,
            op_reply: None,
            in_flight: FuturesUnordered::new(),
            timer: CallTimer::new(),
            started_at,
            connected_at: None,
            ended_at: None,
            end_reason: None,
            ring_deadline: config.ring_timeout().map(|timeout| Instant::now() + timeout),
            engine_tx,
            engine_rx,
            intents,
            snapshot_tx,
            event_tx,
        };

        (session, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn duration_seconds(&self) -> u64 {
        self.timer.seconds()
    }

    pub fn media_state(&self) -> LocalMediaState {
        self.media.state()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            session_id: self.id,
            local: self.local.clone(),
            remote: self.remote.clone(),
            direction: self.direction,
            status: self.status,
            duration_seconds: self.timer.seconds(),
            media: self.media.state(),
            started_at: self.started_at,
            connected_at: self.connected_at,
            ended_at: self.ended_at,
            end_reason: self.end_reason,
        }
    }

    /// Startet die Session als eigenen Task
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    // ========================================================================
    // INTENTS
    // ========================================================================

    /// Wählt: Media und Engine aufsetzen, danach `Initiate` senden
    pub fn initiate(&mut self) -> Result<(), CallError> {
        let allowed = self.direction == Direction::Outgoing && self.status == CallStatus::Ringing;
        self.ensure_idle("initiate", allowed)?;
        self.start_prepare();
        Ok(())
    }

    /// Nimmt an: Media und Engine aufsetzen, danach `Accept` senden
    pub fn accept(&mut self) -> Result<(), CallError> {
        let allowed = self.direction == Direction::Incoming && self.status == CallStatus::Ringing;
        self.ensure_idle("accept", allowed)?;
        self.start_prepare();
        Ok(())
    }

    pub async fn reject(&mut self, reason: Option<String>) -> Result<(), CallError> {
        if self.status.is_ended() {
            return Err(CallError::SessionClosed);
        }
        if self.direction != Direction::Incoming || self.status != CallStatus::Ringing {
            return Err(CallError::InvalidState {
                intent: "reject",
                status: self.status,
            });
        }

        tracing::info!("Rejecting call from {}", self.remote);
        self.send_best_effort(SignalingMessage::Reject { reason })
            .await;
        self.terminate(EndReason::LocalReject).await;
        Ok(())
    }

    /// Legt auf; auf einer beendeten Session ein No-op
    pub async fn end(&mut self) -> Result<(), CallError> {
        self.terminate(EndReason::LocalHangup).await;
        Ok(())
    }

    pub fn toggle_mute(&mut self) -> Result<(), CallError> {
        self.ensure_open()?;
        let audio_enabled = !self.media.state().audio_enabled;
        let state = self.media.set_audio_enabled(audio_enabled);
        tracing::info!("Microphone {}", if audio_enabled { "unmuted" } else { "muted" });
        self.media_changed(state);
        Ok(())
    }

    pub fn toggle_video(&mut self) -> Result<(), CallError> {
        self.ensure_open()?;
        let video_enabled = !self.media.state().video_enabled;
        let state = self.media.set_video_enabled(video_enabled);
        tracing::info!("Video {}", if video_enabled { "enabled" } else { "disabled" });
        self.media_changed(state);
        Ok(())
    }

    /// Wechselt die Kamera; der Track wird ohne Renegotiation ersetzt
    pub fn switch_camera(&mut self) -> Result<(), CallError> {
        let engine = match self.status {
            CallStatus::Connecting | CallStatus::Connected => self.engine.clone(),
            _ => None,
        };
        self.ensure_idle("switch_camera", engine.is_some())?;
        let Some(engine) = engine else {
            return Ok(());
        };

        let previous = self.media.state().active_camera;
        tracing::info!("Switching camera from {:?}", previous);

        self.pending = Some(PendingOp::CameraSwitch);
        let media = self.media.clone();
        self.in_flight.push(
            async move { Completion::CameraSwitched(run_camera_switch(media, engine, previous).await) }
                .boxed(),
        );
        Ok(())
    }

    /// Führt einen Intent aus
    pub async fn apply(&mut self, intent: Intent) -> Result<(), CallError> {
        tracing::debug!("Intent: {}", intent.name());
        match intent {
            Intent::Initiate => self.initiate(),
            Intent::Accept => self.accept(),
            Intent::Reject { reason } => self.reject(reason).await,
            Intent::End => self.end().await,
            Intent::ToggleMute => self.toggle_mute(),
            Intent::ToggleVideo => self.toggle_video(),
            Intent::SwitchCamera => self.switch_camera(),
        }
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.status.is_ended() {
            return Err(CallError::SessionClosed);
        }
        Ok(())
    }

    /// Erlaubt nur wenn keine andere Operation läuft
    fn ensure_idle(&self, intent: &'static str, allowed: bool) -> Result<(), CallError> {
        self.ensure_open()?;
        if !allowed || self.pending.is_some() {
            return Err(CallError::InvalidState {
                intent,
                status: self.status,
            });
        }
        Ok(())
    }

    fn start_prepare(&mut self) {
        let facing = self.media.state().active_camera;
        tracing::info!("Acquiring local media ({:?} camera)", facing);

        self.pending = Some(PendingOp::Prepare);
        let media = self.media.clone();
        let engines = Arc::clone(&self.engines);
        let events = self.engine_tx.clone();
        self.in_flight.push(
            async move { Completion::Prepared(prepare(media, engines, events, facing).await) }
                .boxed(),
        );
    }

    // ========================================================================
    // COMPLETIONS
    // ========================================================================

    async fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Prepared(result) => self.on_prepared(result).await,
            Completion::CameraSwitched(outcome) => self.on_camera_switched(outcome),
        }
    }

    async fn on_prepared(&mut self, result: Result<Arc<dyn PeerConnectionEngine>, CallError>) {
        if self.status.is_ended() {
            // Spätes Ergebnis einer abgebrochenen Session
            if let Ok(engine) = result {
                tracing::info!("Discarding engine created after call ended");
                engine.close().await;
            }
            self.media.release();
            return;
        }
        self.pending = None;

        let engine = match result {
            Ok(engine) => engine,
            Err(e) => {
                let reason = match e {
                    CallError::MediaAcquisitionFailed(_) => EndReason::MediaUnavailable,
                    _ => EndReason::NegotiationFailed,
                };
                self.fail(reason, e).await;
                return;
            }
        };
        self.engine = Some(engine);

        let announcement = match self.direction {
            Direction::Outgoing => SignalingMessage::Initiate,
            Direction::Incoming => SignalingMessage::Accept,
        };
        if !self.send_required(announcement).await {
            return;
        }
        self.announced = true;
        self.set_status(CallStatus::Connecting);
        self.resolve_op(Ok(()));

        if self.direction == Direction::Outgoing {
            self.send_offer_if_ready().await;
        }
    }

    fn on_camera_switched(&mut self, outcome: CameraOutcome) {
        if self.status.is_ended() {
            self.media.release();
            return;
        }
        self.pending = None;

        match outcome {
            CameraOutcome::Switched(facing) => {
                tracing::info!("Camera switched to {:?}", facing);
                self.media_changed(self.media.state());
                self.resolve_op(Ok(()));
            }
            CameraOutcome::Restored(error) => {
                self.media_changed(self.media.state());
                self.emit(CallEvent::Error(error.to_string()));
                self.resolve_op(Err(error));
            }
            CameraOutcome::VideoLost(error) => {
                tracing::warn!("No camera available, continuing without video");
                let state = self.media.set_video_enabled(false);
                self.media_changed(state);
                self.emit(CallEvent::Error(error.to_string()));
                self.resolve_op(Err(error));
            }
        }
    }

    fn resolve_op(&mut self, result: Result<(), CallError>) {
        if let Some(reply) = self.op_reply.take() {
            let _ = reply.send(result);
        }
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    /// Anrufer: Offer erst wenn Engine steht und die Gegenseite angenommen hat
    async fn send_offer_if_ready(&mut self) {
        if !self.remote_accepted || self.offer_sent || self.status != CallStatus::Connecting {
            return;
        }
        let Some(engine) = self.engine.clone() else {
            return;
        };
        self.offer_sent = true;

        let offer = async {
            let offer = engine.create_offer().await?;
            engine.set_local_description(offer.clone()).await?;
            Ok::<_, CallError>(offer)
        }
        .await;

        match offer {
            Ok(description) => {
                tracing::info!("Sending offer to {}", self.remote);
                self.send_required(SignalingMessage::Offer { description })
                    .await;
            }
            Err(e) => self.fail(EndReason::NegotiationFailed, e).await,
        }
    }

    /// Setzt die Remote Description und spielt gepufferte Candidates ab
    async fn apply_remote_description(
        &mut self,
        engine: &Arc<dyn PeerConnectionEngine>,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        let kind = description.kind;
        engine.set_remote_description(description).await?;
        self.has_remote_description = true;

        let buffered = self.candidates.drain_if_ready(true);
        tracing::info!(
            "Applied remote {:?}, replaying {} buffered candidates",
            kind,
            buffered.len()
        );
        for candidate in buffered {
            if let Err(e) = engine.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered ICE candidate: {}", e);
            }
        }
        Ok(())
    }

    async fn on_remote_accept(&mut self) {
        if self.direction != Direction::Outgoing {
            tracing::debug!("Ignoring accept on incoming call");
            return;
        }
        // Vor dem eigenen Initiate kann ein Accept nur von einem früheren Call stammen
        if !self.announced || self.status != CallStatus::Connecting {
            tracing::debug!("Dropping stale accept in {:?}", self.status);
            return;
        }
        tracing::info!("{} accepted the call", self.remote);
        self.remote_accepted = true;
        self.send_offer_if_ready().await;
    }

    async fn on_offer(&mut self, description: SessionDescription) {
        let expected = self.direction == Direction::Incoming
            && self.status == CallStatus::Connecting
            && !self.has_remote_description;
        let engine = match self.engine.clone() {
            Some(engine) if expected => engine,
            _ => {
                tracing::debug!("Ignoring unexpected offer in {:?}", self.status);
                return;
            }
        };

        if let Err(e) = self.apply_remote_description(&engine, description).await {
            self.fail(EndReason::NegotiationFailed, e).await;
            return;
        }

        let answer = async {
            let answer = engine.create_answer().await?;
            engine.set_local_description(answer.clone()).await?;
            Ok::<_, CallError>(answer)
        }
        .await;

        match answer {
            Ok(description) => {
                tracing::info!("Sending answer to {}", self.remote);
                self.send_required(SignalingMessage::Answer { description })
                    .await;
            }
            Err(e) => self.fail(EndReason::NegotiationFailed, e).await,
        }
    }

    async fn on_answer(&mut self, description: SessionDescription) {
        let expected = self.direction == Direction::Outgoing
            && self.offer_sent
            && !self.has_remote_description;
        let engine = match self.engine.clone() {
            Some(engine) if expected => engine,
            _ => {
                tracing::debug!("Ignoring unexpected answer in {:?}", self.status);
                return;
            }
        };

        if let Err(e) = self.apply_remote_description(&engine, description).await {
            self.fail(EndReason::NegotiationFailed, e).await;
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.engine.clone() {
            Some(engine) if self.has_remote_description => {
                tracing::debug!("Adding remote ICE candidate");
                if let Err(e) = engine.add_ice_candidate(candidate).await {
                    tracing::warn!("Failed to add ICE candidate: {}", e);
                }
            }
            _ => {
                self.candidates.push(candidate);
                tracing::debug!(
                    "Buffered remote ICE candidate ({} pending)",
                    self.candidates.len()
                );
            }
        }
    }

    // ========================================================================
    // INBOUND EVENTS
    // ========================================================================

    /// Verarbeitet eine Nachricht der Gegenseite
    pub async fn handle_inbound(&mut self, inbound: Inbound) {
        if self.status.is_ended() {
            tracing::debug!("Dropping {} after call ended", inbound.message.kind());
            return;
        }
        if inbound.from != self.remote {
            tracing::debug!(
                "Dropping {} from unrelated identity {}",
                inbound.message.kind(),
                inbound.from
            );
            return;
        }

        match inbound.message {
            SignalingMessage::Accept => self.on_remote_accept().await,
            SignalingMessage::Offer { description } => self.on_offer(description).await,
            SignalingMessage::Answer { description } => self.on_answer(description).await,
            SignalingMessage::IceCandidate { candidate } => {
                self.on_remote_candidate(candidate).await
            }
            SignalingMessage::Reject { reason } => {
                tracing::info!(
                    "{} rejected the call ({})",
                    self.remote,
                    reason.as_deref().unwrap_or("no reason")
                );
                self.terminate(EndReason::RemoteReject).await;
            }
            SignalingMessage::End => {
                tracing::info!("{} ended the call", self.remote);
                self.terminate(EndReason::RemoteHangup).await;
            }
            SignalingMessage::Initiate => {
                tracing::debug!("Ignoring repeated initiate from {}", self.remote);
            }
        }
    }

    /// Verarbeitet einen Callback der Engine
    pub async fn handle_engine_event(&mut self, event: EngineEvent) {
        if self.status.is_ended() {
            return;
        }

        match event {
            EngineEvent::IceCandidate(candidate) => {
                tracing::debug!("Sending local ICE candidate");
                self.send_best_effort(SignalingMessage::IceCandidate { candidate })
                    .await;
            }
            EngineEvent::Track(track) => {
                tracing::info!("Remote {:?} track ready ({})", track.kind, track.id);
                self.emit(CallEvent::RemoteStreamReady(track));
            }
            EngineEvent::ConnectionState(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        tracing::info!("Peer connection state: {:?}", state);

        match state {
            ConnectionState::Connected => match self.status {
                CallStatus::Connecting => {
                    self.connected_at = Some(Utc::now());
                    self.timer.start();
                    self.set_status(CallStatus::Connected);
                }
                CallStatus::Connected => {
                    if !self.timer.start() {
                        tracing::debug!("Ignoring duplicate connected state");
                    }
                }
                _ => tracing::debug!("Ignoring connected state in {:?}", self.status),
            },
            ConnectionState::Disconnected => {
                tracing::warn!("Peer connection disconnected, waiting for recovery");
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                let error = CallError::NegotiationFailed(format!(
                    "peer connection {}",
                    if state == ConnectionState::Failed { "failed" } else { "closed" }
                ));
                self.fail(EndReason::NegotiationFailed, error).await;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    /// Eine Sekunde Gesprächsdauer; nur wirksam solange der Timer läuft
    pub fn tick(&mut self) {
        if let Some(seconds) = self.timer.tick() {
            self.emit(CallEvent::DurationChanged(seconds));
            self.publish();
        }
    }

    async fn on_ring_timeout(&mut self) {
        if matches!(self.status, CallStatus::Ringing | CallStatus::Connecting) {
            tracing::warn!("Call with {} not connected in time", self.remote);
            self.terminate(EndReason::Timeout).await;
        }
    }

    // ========================================================================
    // TERMINATION
    // ========================================================================

    /// Beendet die Session; `false` wenn sie bereits beendet war
    async fn terminate(&mut self, reason: EndReason) -> bool {
        self.terminate_with(reason, CallError::SessionClosed).await
    }

    /// Wie `terminate`, eine offene Operation endet aber mit `error`
    ///
    /// Die Antwort geht erst raus, wenn Engine und Media freigegeben sind.
    async fn terminate_with(&mut self, reason: EndReason, error: CallError) -> bool {
        if self.status.is_ended() {
            return false;
        }

        tracing::info!(
            "Ending call with {} ({:?}) after {}s",
            self.remote,
            reason,
            self.timer.seconds()
        );
        self.mark_ended(reason);

        let farewell = self.farewell(reason);
        if let Some(message) = farewell {
            self.send_best_effort(message).await;
        }

        if let Some(engine) = self.engine.take() {
            engine.close().await;
        }
        self.media.release();
        self.subscription = None;
        self.candidates = PendingCandidateBuffer::new();

        self.resolve_op(Err(error));
        self.emit(CallEvent::StatusChanged(CallStatus::Ended));
        self.publish();
        true
    }

    fn mark_ended(&mut self, reason: EndReason) {
        self.timer.stop();
        self.status = CallStatus::Ended;
        self.end_reason = Some(reason);
        self.ended_at = Some(Utc::now());
        self.pending = None;
    }

    /// Abschlussnachricht an die Gegenseite, falls sie vom Call weiß
    fn farewell(&self, reason: EndReason) -> Option<SignalingMessage> {
        if !self.announced {
            return None;
        }
        match reason {
            EndReason::RemoteHangup | EndReason::RemoteReject | EndReason::LocalReject => None,
            EndReason::MediaUnavailable if self.direction == Direction::Incoming => {
                Some(SignalingMessage::Reject {
                    reason: Some("media unavailable".to_string()),
                })
            }
            _ => Some(SignalingMessage::End),
        }
    }

    async fn fail(&mut self, reason: EndReason, error: CallError) {
        tracing::error!("Call failed: {}", error);
        let message = error.to_string();
        self.terminate_with(reason, error).await;
        self.emit(CallEvent::Error(message));
    }

    // ========================================================================
    // SIGNALING HELPERS
    // ========================================================================

    /// Sendet eine Nachricht, deren Verlust den Call beendet
    async fn send_required(&mut self, message: SignalingMessage) -> bool {
        let kind = message.kind();
        match self.channel.send(&self.remote, message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to send {} to {}: {}", kind, self.remote, e);
                self.fail(EndReason::SignalingFailed, e.into()).await;
                false
            }
        }
    }

    async fn send_best_effort(&mut self, message: SignalingMessage) {
        let kind = message.kind();
        if let Err(e) = self.channel.send(&self.remote, message).await {
            tracing::warn!("Failed to send {} to {}: {}", kind, self.remote, e);
        }
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    fn set_status(&mut self, status: CallStatus) {
        tracing::info!("Call status: {:?} -> {:?}", self.status, status);
        self.status = status;
        self.emit(CallEvent::StatusChanged(status));
        self.publish();
    }

    fn media_changed(&self, state: LocalMediaState) {
        self.emit(CallEvent::MediaStateChanged(state));
        self.publish();
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    // ========================================================================
    // EVENT LOOP
    // ========================================================================

    async fn dispatch(&mut self, request: IntentRequest) {
        let IntentRequest { intent, reply } = request;
        let deferred = intent.is_deferred();

        let result = self.apply(intent).await;
        if deferred && result.is_ok() && self.pending.is_some() {
            self.op_reply = Some(reply);
        } else {
            let _ = reply.send(result);
        }
    }

    /// Verarbeitet alles was ohne Warten bereitsteht
    ///
    /// Abgeschlossene Operationen, Engine-Events, Nachrichten der Gegenseite
    /// und Intents werden so lange abgearbeitet bis keine Quelle mehr etwas
    /// liefert. Der Gesprächs-Timer wird hier nicht weitergezählt.
    pub async fn drain_ready(&mut self) {
        loop {
            let mut progressed = false;

            while let Some(Some(completion)) = self.in_flight.next().now_or_never() {
                self.complete(completion).await;
                progressed = true;
            }
            while let Ok(request) = self.intents.try_recv() {
                self.dispatch(request).await;
                progressed = true;
            }
            while let Ok(event) = self.engine_rx.try_recv() {
                self.handle_engine_event(event).await;
                progressed = true;
            }
            while let Some(inbound) = self.subscription.as_mut().and_then(Subscription::try_recv) {
                self.handle_inbound(inbound).await;
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
    }

    /// Läuft bis die Session beendet ist und keine Operation mehr aussteht
    pub async fn run(self) {
        let span = tracing::info_span!(
            "call",
            session = %self.id,
            remote = %self.remote,
            direction = ?self.direction
        );
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) {
        tracing::info!("Call session started");
        let mut ticker: Option<Interval> = None;
        let ring_deadline = self.ring_deadline;

        loop {
            if self.status.is_ended() && self.in_flight.is_empty() {
                break;
            }

            match (self.timer.is_running(), ticker.is_some()) {
                (true, false) => {
                    ticker = Some(tokio::time::interval_at(Instant::now() + TICK, TICK));
                }
                (false, true) => ticker = None,
                _ => {}
            }

            let open = !self.status.is_ended();
            let awaiting = matches!(self.status, CallStatus::Ringing | CallStatus::Connecting);

            tokio::select! {
                request = self.intents.recv(), if open => match request {
                    Some(request) => self.dispatch(request).await,
                    None => {
                        tracing::info!("All call handles dropped, hanging up");
                        self.terminate(EndReason::LocalHangup).await;
                    }
                },
                Some(completion) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.complete(completion).await;
                }
                Some(event) = self.engine_rx.recv(), if open => {
                    self.handle_engine_event(event).await;
                }
                Some(inbound) = next_inbound(&mut self.subscription), if open => {
                    self.handle_inbound(inbound).await;
                }
                _ = next_tick(&mut ticker) => self.tick(),
                _ = wait_until(ring_deadline), if open && awaiting => {
                    self.on_ring_timeout().await;
                }
                else => break,
            }
        }

        tracing::info!("Call session finished ({:?})", self.end_reason);
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { engine.close().await });
            }
        }
        if self.media.release() {
            tracing::debug!("Released local media of dropped call session");
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("status", &self.status)
            .field("pending", &self.pending)
            .field("duration", &self.timer.seconds())
            .finish()
    }
}
