//! UI-seitiger Handle auf eine laufende Call Session

use super::call::CallError;
use super::state::{CallEvent, CallSnapshot, CallStatus, Intent};
use crate::signaling::Identity;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

/// Intent mit Rückkanal für das Ergebnis
pub(crate) struct IntentRequest {
    pub intent: Intent,
    pub reply: oneshot::Sender<Result<(), CallError>>,
}

/// Handle auf eine Session; Clones steuern dieselbe Session
///
/// Werden alle Handles gedroppt, legt eine laufende Session auf.
#[derive(Clone)]
pub struct CallHandle {
    session_id: Uuid,
    remote: Identity,
    intents: mpsc::Sender<IntentRequest>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    pub(crate) fn new(
        session_id: Uuid,
        remote: Identity,
        intents: mpsc::Sender<IntentRequest>,
        snapshot: watch::Receiver<CallSnapshot>,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            session_id,
            remote,
            intents,
            snapshot,
            events,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    /// Aktueller Zustand
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> CallStatus {
        self.snapshot.borrow().status
    }

    /// Receiver der bei jeder Zustandsänderung benachrichtigt wird
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Wartet bis die Session `status` erreicht hat
    ///
    /// Endet die Session vorher, gibt es `SessionClosed`.
    pub async fn wait_for_status(&self, status: CallStatus) -> Result<CallSnapshot, CallError> {
        let mut snapshot = self.snapshot.clone();
        let result = snapshot
            .wait_for(|s| s.status == status || s.status.is_ended())
            .await
            .map(|s| s.clone())
            .map_err(|_| CallError::SessionClosed)?;

        if result.status != status {
            return Err(CallError::SessionClosed);
        }
        Ok(result)
    }

    /// Wählt; kehrt zurück sobald `Initiate` gesendet wurde
    pub async fn initiate(&self) -> Result<(), CallError> {
        self.request(Intent::Initiate).await
    }

    /// Nimmt an; kehrt zurück sobald `Accept` gesendet wurde
    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(Intent::Accept).await
    }

    pub async fn reject(&self, reason: Option<String>) -> Result<(), CallError> {
        self.request(Intent::Reject { reason }).await
    }

    /// Legt auf; auch auf einer bereits beendeten Session erfolgreich
    pub async fn end(&self) -> Result<(), CallError> {
        match self.request(Intent::End).await {
            Err(CallError::SessionClosed) => Ok(()),
            other => other,
        }
    }

    pub async fn toggle_mute(&self) -> Result<(), CallError> {
        self.request(Intent::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<(), CallError> {
        self.request(Intent::ToggleVideo).await
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.request(Intent::SwitchCamera).await
    }

    async fn request(&self, intent: Intent) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        self.intents
            .send(IntentRequest { intent, reply })
            .await
            .map_err(|_| CallError::SessionClosed)?;
        response.await.map_err(|_| CallError::SessionClosed)?
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("session_id", &self.session_id)
            .field("remote", &self.remote)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::call_engine::{ConnectionState, EngineEvent, MediaError};
    use crate::session::{CallError, CallSession, CallStatus, EndReason};
    use crate::signaling::{SignalingChannel, SignalingError};
    use crate::testing::{CallHarness, MockCapture, MockEngineFactory};
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_two_sessions_complete_a_call() {
        let harness = CallHarness::new();
        let callee_engines = Arc::new(MockEngineFactory::default());
        let callee_capture = Arc::new(MockCapture::default());
        let callee_deps = harness.peer_deps(callee_engines.clone(), callee_capture.clone());
        let mut incoming = harness.peer.incoming_calls();

        let (caller, caller_handle) = harness.outgoing();
        caller.spawn();
        caller_handle.initiate().await.unwrap();

        let call = tokio::time::timeout(WAIT, incoming.recv()).await.unwrap().unwrap();
        assert_eq!(call.from, harness.local.local_identity());
        let (callee, callee_handle) = CallSession::incoming(call, callee_deps);
        callee.spawn();
        callee_handle.accept().await.unwrap();

        // Offer/Answer laufen ohne weiteres Zutun über den Hub
        tokio::time::timeout(WAIT, async {
            while callee_engines.last().map_or(true, |e| e.calls().len() < 5) {
                tokio::task::yield_now().await;
            }
            while harness.engine().calls().len() < 5 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        harness
            .engine()
            .emit(EngineEvent::ConnectionState(ConnectionState::Connected));
        callee_engines
            .last()
            .unwrap()
            .emit(EngineEvent::ConnectionState(ConnectionState::Connected));

        tokio::time::timeout(WAIT, caller_handle.wait_for_status(CallStatus::Connected))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(WAIT, callee_handle.wait_for_status(CallStatus::Connected))
            .await
            .unwrap()
            .unwrap();

        caller_handle.end().await.unwrap();
        let ended = tokio::time::timeout(WAIT, callee_handle.wait_for_status(CallStatus::Ended))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ended.end_reason, Some(EndReason::RemoteHangup));
        assert_eq!(harness.capture.live_tracks(), 0);
        assert_eq!(callee_capture.live_tracks(), 0);

        // Zweites Auflegen ist ein No-op
        caller_handle.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_initiate_reports_media_failure() {
        let harness = CallHarness::new();
        harness.capture.fail_with(MediaError::DeviceUnavailable("no microphone".to_string()));
        let (session, handle) = harness.outgoing();
        session.spawn();

        let err = handle.initiate().await.unwrap_err();
        assert_eq!(
            err,
            CallError::MediaAcquisitionFailed(MediaError::DeviceUnavailable(
                "no microphone".to_string()
            ))
        );
        let snapshot = handle.wait_for_status(CallStatus::Ended).await.unwrap();
        assert_eq!(snapshot.end_reason, Some(EndReason::MediaUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_reported_after_release() {
        let harness = CallHarness::new();
        harness.engines.close_after(Duration::from_millis(200));
        harness.local.set_offline(true);
        let (session, handle) = harness.outgoing();
        session.spawn();

        let err = handle.initiate().await.unwrap_err();

        assert_eq!(err, CallError::Signaling(SignalingError::NotConnected));
        assert_eq!(harness.capture.open_count(), 2);
        assert_eq!(harness.capture.live_tracks(), 0);
        assert_eq!(harness.engine().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_ends_unanswered_call() {
        let mut harness = CallHarness::new();
        harness.config.ring_timeout_secs = Some(30);
        let (session, handle) = harness.outgoing();
        session.spawn();

        handle.initiate().await.unwrap();
        let snapshot = handle.wait_for_status(CallStatus::Ended).await.unwrap();

        assert_eq!(snapshot.end_reason, Some(EndReason::Timeout));
        assert_eq!(harness.capture.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_counts_while_connected() {
        let harness = CallHarness::new();
        let (session, handle) = harness.outgoing();
        let mut watch = handle.watch();
        session.spawn();

        handle.initiate().await.unwrap();
        harness
            .from_peer(crate::signaling::SignalingMessage::Accept)
            .await;
        harness
            .from_peer(crate::signaling::SignalingMessage::Answer {
                description: crate::call_engine::SessionDescription::answer("v=0"),
            })
            .await;
        harness
            .engine()
            .emit(EngineEvent::ConnectionState(ConnectionState::Connected));
        handle.wait_for_status(CallStatus::Connected).await.unwrap();

        let snapshot = watch
            .wait_for(|s| s.duration_seconds >= 5)
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.duration_seconds, 5);
        assert_eq!(snapshot.status, CallStatus::Connected);
    }

    #[tokio::test]
    async fn test_invalid_intent_is_reported() {
        let harness = CallHarness::new();
        let (session, handle) = harness.outgoing();
        session.spawn();

        assert_eq!(
            handle.accept().await,
            Err(CallError::InvalidState {
                intent: "accept",
                status: CallStatus::Ringing
            })
        );
        assert_eq!(handle.status(), CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_dropping_all_handles_hangs_up() {
        let harness = CallHarness::new();
        let (session, handle) = harness.incoming().await;
        let watch = handle.watch();
        let task = session.spawn();

        drop(handle);
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();

        assert_eq!(watch.borrow().end_reason, Some(EndReason::LocalHangup));
        assert_eq!(
            harness.sent(),
            vec![crate::signaling::SignalingMessage::End]
        );
    }
}
