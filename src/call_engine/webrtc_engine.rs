//! WebRTC Engine - `PeerConnectionEngine` auf Basis von webrtc-rs
//!
//! Erstellt pro Call eine `RTCPeerConnection` und leitet deren Callbacks
//! als `EngineEvent` an die Session weiter.

use super::engine::{
    ConnectionState, EngineError, EngineEvent, EngineEvents, EngineFactory, IceCandidate,
    PeerConnectionEngine, RemoteTrack, SdpKind, SessionDescription,
};
use super::media::{LocalTrack, TrackKind};
use crate::config::CallConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn webrtc_error(e: webrtc::Error) -> EngineError {
    EngineError::WebRtc(e.to_string())
}

// ============================================================================
// ENGINE FACTORY
// ============================================================================

/// Erzeugt `WebRtcEngine`-Instanzen mit den konfigurierten ICE Servern
#[derive(Debug, Clone)]
pub struct WebRtcEngineFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngineFactory {
    pub fn new(config: &CallConfig) -> Self {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        Self { ice_servers }
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        events: EngineEvents,
    ) -> Result<Arc<dyn PeerConnectionEngine>, EngineError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(webrtc_error)?,
        );

        register_handlers(&pc, events);

        Ok(Arc::new(WebRtcEngine {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

/// Registriert die Callbacks der Peer Connection
fn register_handlers(pc: &RTCPeerConnection, events: EngineEvents) {
    // Connection State Handler
    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let state = match s {
            RTCPeerConnectionState::New => Some(ConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
            _ => None,
        };
        if let Some(state) = state {
            let _ = state_tx.send(EngineEvent::ConnectionState(state));
        }

        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let candidate_tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = candidate_tx.send(EngineEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler (eingehende Media der Gegenseite)
    let track_tx = events;
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let _ = track_tx.send(EngineEvent::Track(RemoteTrack {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
        }));
        Box::pin(async {})
    }));
}

// ============================================================================
// ENGINE
// ============================================================================

/// Peer Connection eines einzelnen Calls
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| EngineError::InvalidSdp(e.to_string()))
}

#[async_trait]
impl PeerConnectionEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(webrtc_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(webrtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(webrtc_error)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), EngineError> {
        let sender = self
            .pc
            .add_track(track.sink() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_error)?;
        self.senders.lock().insert(track.kind(), sender);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<(), EngineError> {
        let sender = self
            .senders
            .lock()
            .get(&kind)
            .cloned()
            .ok_or_else(|| EngineError::WebRtc(format!("no outbound {:?} sender", kind)))?;

        sender
            .replace_track(Some(track.sink() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(webrtc_error)
    }

    async fn close(&self) {
        self.senders.lock().clear();
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

impl std::fmt::Debug for WebRtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEngine")
            .field("connection_state", &self.pc.connection_state())
            .field("senders", &self.senders.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServerConfig;

    #[test]
    fn test_factory_maps_ice_servers() {
        let config = CallConfig {
            ice_servers: vec![IceServerConfig {
                urls: vec!["turn:turn.example.org:3478".to_string()],
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
            ..CallConfig::default()
        };

        let factory = WebRtcEngineFactory::new(&config);

        assert_eq!(factory.ice_servers.len(), 1);
        assert_eq!(factory.ice_servers[0].username, "user");
        assert_eq!(factory.ice_servers[0].credential, "secret");
    }

    #[test]
    fn test_invalid_description_is_rejected() {
        assert!(to_rtc(SessionDescription::offer("not an sdp")).is_err());
    }
}
