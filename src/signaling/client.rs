//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay-Server:
//! - Registrierung der eigenen Identity
//! - Heartbeat-Keeping
//! - Weiterleitung eingehender Nachrichten an den `SignalingRouter`

use super::channel::{IncomingCalls, SignalingChannel, SignalingRouter, Subscription};
use super::messages::*;
use crate::config::CallConfig;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },

    #[error("Failed to encode message: {0}")]
    Serialization(String),
}

// ============================================================================
// CONNECTION EVENTS
// ============================================================================

/// Events zum Zustand der Relay-Verbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Registered { identity: Identity },
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    is_registered: bool,
}

/// Baut die WebSocket-URL aus der konfigurierten Server-URL
pub fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::ConnectionFailed(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::ConnectionFailed("cannot set scheme".to_string()))?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation über den Relay
pub struct SignalingClient {
    server_url: String,
    identity: Identity,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    router: SignalingRouter,
    event_tx: broadcast::Sender<ConnectionEvent>,
    register_timeout: Duration,
    heartbeat_interval: Duration,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient mit Default-Timeouts
    pub fn new(server_url: String, identity: Identity) -> Self {
        let mut config = CallConfig::default();
        config.signaling_url = server_url;
        Self::from_config(&config, identity)
    }

    /// Client für `config.signaling_url` mit den konfigurierten Timeouts
    pub fn from_config(config: &CallConfig, identity: Identity) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url: config.signaling_url.clone(),
            identity,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            router: SignalingRouter::new(),
            event_tx,
            register_timeout: config.register_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    /// Verbindet, registriert und startet den Heartbeat
    pub async fn connect(&mut self) -> Result<(), SignalingError> {
        self.connect_and_register(self.register_timeout).await?;
        self.start_heartbeat(self.heartbeat_interval);
        Ok(())
    }

    /// Gibt einen Event-Receiver für den Verbindungszustand zurück
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn is_registered(&self) -> bool {
        self.state.read().is_registered
    }

    /// Verbindet mit dem Relay und registriert die eigene Identity
    pub async fn connect_and_register(
        &mut self,
        register_timeout: Duration,
    ) -> Result<(), SignalingError> {
        let ws_url = websocket_url(&self.server_url)?;

        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);
        self.tx = Some(tx);

        self.state.write().is_connected = true;
        let _ = self.event_tx.send(ConnectionEvent::Connected);

        // Channel für Registrierungs-Response
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<(), SignalingError>>(1);

        // Read-Task starten
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let router = self.router.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(
                                server_msg, &state, &router, &event_tx, &reg_tx,
                            )
                            .await;
                        }
                        Err(e) => tracing::warn!("Ignoring malformed server message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            {
                let mut s = state.write();
                s.is_connected = false;
                s.is_registered = false;
            }
            let _ = event_tx.send(ConnectionEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        self.send_client_message(&ClientMessage::Register {
            identity: self.identity.clone(),
            timestamp: Utc::now().timestamp_millis(),
        })
        .await?;

        tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(result) => result,
                    None => Err(SignalingError::RegistrationFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(register_timeout) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Startet einen Heartbeat-Task, der endet sobald die Verbindung weg ist
    pub fn start_heartbeat(&self, interval: Duration) {
        let Some(tx) = self.tx.clone() else {
            tracing::warn!("Heartbeat not started: not connected");
            return;
        };
        let state = Arc::clone(&self.state);
        let identity = self.identity.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !state.read().is_connected {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }

                let heartbeat = ClientMessage::Heartbeat {
                    identity: identity.clone(),
                    timestamp: Utc::now().timestamp_millis(),
                };
                let Ok(text) = serde_json::to_string(&heartbeat) else {
                    break;
                };
                if let Err(e) = tx.try_send(text) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    async fn send_client_message(&self, msg: &ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        let text =
            serde_json::to_string(msg).map_err(|e| SignalingError::Serialization(e.to_string()))?;

        tx.send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Server-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        router: &SignalingRouter,
        event_tx: &broadcast::Sender<ConnectionEvent>,
        reg_tx: &mpsc::Sender<Result<(), SignalingError>>,
    ) {
        match msg {
            ServerMessage::Registered { identity, .. } => {
                tracing::info!("Registered as {}", identity);
                state.write().is_registered = true;
                let _ = reg_tx.try_send(Ok(()));
                let _ = event_tx.send(ConnectionEvent::Registered { identity });
            }

            ServerMessage::Signal { from, payload, .. } => {
                tracing::debug!("Received {} from {}", payload.kind(), from);
                router.route(from, payload);
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Server error {}: {}", code, message);
                // Bei Registrierungs-Fehlern auch dem reg_tx melden
                if !state.read().is_registered {
                    let _ = reg_tx.try_send(Err(SignalingError::ServerError {
                        code,
                        message: message.clone(),
                    }));
                }
                let _ = event_tx.send(ConnectionEvent::Error { code, message });
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    fn local_identity(&self) -> Identity {
        self.identity.clone()
    }

    async fn send(
        &self,
        target: &Identity,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        self.send_client_message(&ClientMessage::Signal {
            from: self.identity.clone(),
            to: target.clone(),
            payload: message,
            timestamp: Utc::now().timestamp_millis(),
        })
        .await
    }

    fn subscribe(&self, remote: &Identity) -> Subscription {
        self.router.subscribe(remote)
    }

    fn incoming_calls(&self) -> IncomingCalls {
        self.router.incoming_calls()
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("identity", &self.identity)
            .field("state", &*self.state.read())
            .finish()
    }
}
