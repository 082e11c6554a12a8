//! Signaling Channel - Schnittstelle und Routing
//!
//! Der Channel wird prozessweit geteilt. Jede Call Session abonniert nur
//! die Nachrichten ihrer Gegenseite (`Subscription`), eingehende Anrufe
//! (`Initiate`) landen in einer eigenen Queue (`IncomingCalls`).

use super::client::SignalingError;
use super::messages::{Identity, Inbound, SignalingMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

// ============================================================================
// CHANNEL TRAIT
// ============================================================================

/// Transport für Nachrichten zwischen zwei Teilnehmern
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Eigene Identity auf diesem Channel
    fn local_identity(&self) -> Identity;

    async fn send(&self, target: &Identity, message: SignalingMessage)
        -> Result<(), SignalingError>;

    /// Abonniert alle Nachrichten (außer `Initiate`) von `remote`
    ///
    /// Ein neues Abo für dieselbe Identity ersetzt das vorherige und nimmt
    /// einen noch offenen `IncomingCall` dieser Identity in Besitz.
    fn subscribe(&self, remote: &Identity) -> Subscription;

    /// Queue der eingehenden Anrufe
    fn incoming_calls(&self) -> IncomingCalls;
}

// ============================================================================
// ROUTER
// ============================================================================

struct Route {
    token: u64,
    tx: mpsc::UnboundedSender<Inbound>,
}

#[derive(Default)]
struct RouterInner {
    routes: Mutex<HashMap<Identity, Route>>,
    incoming: Mutex<Option<mpsc::UnboundedSender<IncomingCall>>>,
    /// Zugestellte Anrufe, für die noch keine Session abonniert hat
    unclaimed: Mutex<HashMap<Identity, Arc<AtomicBool>>>,
    next_token: AtomicU64,
}

/// Verteilt eingehende Nachrichten an die passende Subscription
#[derive(Clone, Default)]
pub struct SignalingRouter {
    inner: Arc<RouterInner>,
}

impl SignalingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, remote: &Identity) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        let mut routes = self.inner.routes.lock();
        let replaced = routes.insert(remote.clone(), Route { token, tx });
        // Unter dem routes-Lock, damit kein End zwischen beiden Maps verloren geht
        self.inner.unclaimed.lock().remove(remote);
        drop(routes);
        if replaced.is_some() {
            tracing::debug!("Replaced existing subscription for {}", remote);
        }

        Subscription {
            remote: remote.clone(),
            token,
            rx,
            router: Arc::downgrade(&self.inner),
        }
    }

    pub fn incoming_calls(&self) -> IncomingCalls {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.incoming.lock() = Some(tx);
        IncomingCalls { rx }
    }

    /// Stellt eine Nachricht zu; gibt `false` zurück wenn sie verworfen wurde
    pub fn route(&self, from: Identity, message: SignalingMessage) -> bool {
        if message == SignalingMessage::Initiate {
            let incoming = self.inner.incoming.lock();
            let cancelled = Arc::new(AtomicBool::new(false));
            let delivered = incoming.as_ref().is_some_and(|tx| {
                tx.send(IncomingCall {
                    from: from.clone(),
                    received_at: Utc::now(),
                    cancelled: Arc::clone(&cancelled),
                })
                .is_ok()
            });
            if delivered {
                self.inner.unclaimed.lock().insert(from, cancelled);
            } else {
                tracing::warn!("Dropping call from {}: nobody listens for incoming calls", from);
            }
            return delivered;
        }

        let mut routes = self.inner.routes.lock();
        let Some(route) = routes.get(&from) else {
            if matches!(message, SignalingMessage::End | SignalingMessage::Reject { .. }) {
                if let Some(cancelled) = self.inner.unclaimed.lock().remove(&from) {
                    tracing::info!("{} cancelled the call before it was picked up", from);
                    cancelled.store(true, Ordering::SeqCst);
                    return true;
                }
            }
            tracing::debug!("Dropping stale {} from {}", message.kind(), from);
            return false;
        };

        let kind = message.kind();
        if route.tx.send(Inbound { from: from.clone(), message }).is_err() {
            tracing::debug!("Dropping {} from {}: session gone", kind, from);
            routes.remove(&from);
            return false;
        }
        true
    }

    pub fn has_subscriber(&self, remote: &Identity) -> bool {
        self.inner.routes.lock().contains_key(remote)
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Nachrichten einer einzelnen Gegenseite; meldet sich beim Drop ab
pub struct Subscription {
    remote: Identity,
    token: u64,
    rx: mpsc::UnboundedReceiver<Inbound>,
    router: Weak<RouterInner>,
}

impl Subscription {
    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(router) = self.router.upgrade() else {
            return;
        };
        let mut routes = router.routes.lock();
        // Nur das eigene Abo entfernen, nicht ein neueres für dieselbe Identity
        if routes.get(&self.remote).is_some_and(|r| r.token == self.token) {
            routes.remove(&self.remote);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("remote", &self.remote)
            .field("token", &self.token)
            .finish()
    }
}

// ============================================================================
// INCOMING CALLS
// ============================================================================

/// Eingehender Anruf, aus dem eine Session erzeugt wird
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub from: Identity,
    pub received_at: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

impl IncomingCall {
    /// Anrufer hat aufgelegt, bevor eine Session abonniert hat
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct IncomingCalls {
    rx: mpsc::UnboundedReceiver<IncomingCall>,
}

impl IncomingCalls {
    pub async fn recv(&mut self) -> Option<IncomingCall> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<IncomingCall> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// IN-PROCESS SIGNALING
// ============================================================================

/// Verbindet mehrere lokale Endpoints ohne Netzwerk
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<Mutex<HashMap<Identity, SignalingRouter>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Erstellt (oder ersetzt) den Endpoint für `identity`
    pub fn endpoint(&self, identity: impl Into<Identity>) -> MemorySignaling {
        let identity = identity.into();
        let router = SignalingRouter::new();
        self.endpoints
            .lock()
            .insert(identity.clone(), router.clone());

        MemorySignaling {
            identity,
            hub: self.clone(),
            router,
            sent: Arc::new(Mutex::new(Vec::new())),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    fn router_for(&self, identity: &Identity) -> Option<SignalingRouter> {
        self.endpoints.lock().get(identity).cloned()
    }
}

/// Endpoint eines `MemoryHub`; protokolliert alle gesendeten Nachrichten
#[derive(Clone)]
pub struct MemorySignaling {
    identity: Identity,
    hub: MemoryHub,
    router: SignalingRouter,
    sent: Arc<Mutex<Vec<(Identity, SignalingMessage)>>>,
    offline: Arc<AtomicBool>,
}

impl MemorySignaling {
    /// Alle bisher gesendeten Nachrichten (Ziel, Nachricht)
    pub fn sent_messages(&self) -> Vec<(Identity, SignalingMessage)> {
        self.sent.lock().clone()
    }

    /// Simuliert einen Verbindungsverlust: `send` schlägt fehl
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn router(&self) -> &SignalingRouter {
        &self.router
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    fn local_identity(&self) -> Identity {
        self.identity.clone()
    }

    async fn send(
        &self,
        target: &Identity,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }

        let router = self
            .hub
            .router_for(target)
            .ok_or_else(|| SignalingError::SendFailed(format!("unknown peer {}", target)))?;

        self.sent.lock().push((target.clone(), message.clone()));
        router.route(self.identity.clone(), message);
        Ok(())
    }

    fn subscribe(&self, remote: &Identity) -> Subscription {
        self.router.subscribe(remote)
    }

    fn incoming_calls(&self) -> IncomingCalls {
        self.router.incoming_calls()
    }
}

impl std::fmt::Debug for MemorySignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySignaling")
            .field("identity", &self.identity)
            .field("sent", &self.sent.lock().len())
            .finish()
    }
}
