//! In-Process Relay
//!
//! Bildet den Weiterleitungsvertrag des Signaling-Servers im Speicher nach:
//! jede Identität hat genau eine Route, Envelopes werden anhand des
//! Empfängers zugestellt, unbekannte Empfänger werden stillschweigend
//! verworfen (wie ein `group_send` an eine leere Gruppe).

use super::channel::{SignalInbound, SignalingError, SignalingSink};
use super::messages::{is_valid_identity, Envelope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Route einer Verbindung; `token` unterscheidet Neuverbindungen derselben
/// Identität
struct Route {
    token: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// Relay für mehrere Identitäten innerhalb eines Prozesses
#[derive(Clone, Default)]
pub struct LocalRelay {
    routes: Routes,
    next_token: Arc<AtomicU64>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert `identity` und gibt deren Kanal zurück
    pub fn connect(&self, identity: &str) -> Result<(LocalChannel, SignalInbound), SignalingError> {
        if !is_valid_identity(identity) {
            return Err(SignalingError::InvalidIdentity(identity.to_string()));
        }

        let mut routes = self.routes.lock();
        if routes.get(identity).is_some_and(|route| !route.tx.is_closed()) {
            return Err(SignalingError::AlreadyConnected(identity.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        routes.insert(identity.to_string(), Route { token, tx });
        tracing::debug!("Relay: '{}' joined", identity);

        let channel = LocalChannel {
            identity: identity.to_string(),
            token,
            routes: Arc::clone(&self.routes),
            open: Arc::new(AtomicBool::new(true)),
        };

        Ok((channel, SignalInbound::new(rx)))
    }

    /// Trennt `identity` vom Relay; deren eingehender Stream endet.
    pub fn disconnect(&self, identity: &str) {
        if self.routes.lock().remove(identity).is_some() {
            tracing::debug!("Relay: '{}' left", identity);
        }
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.routes
            .lock()
            .get(identity)
            .is_some_and(|route| !route.tx.is_closed())
    }
}

/// Kanal einer Identität am [`LocalRelay`]
#[derive(Clone)]
pub struct LocalChannel {
    identity: String,
    token: u64,
    routes: Routes,
    open: Arc<AtomicBool>,
}

impl LocalChannel {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Schließt den Kanal in beide Richtungen. Eine neuere Verbindung
    /// derselben Identität bleibt bestehen.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut routes = self.routes.lock();
        if routes
            .get(&self.identity)
            .is_some_and(|route| route.token == self.token)
        {
            routes.remove(&self.identity);
        }
    }
}

impl SignalingSink for LocalChannel {
    fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::NotConnected);
        }

        let routes = self.routes.lock();
        match routes.get(&envelope.to) {
            Some(route) => {
                if route.tx.send(envelope).is_err() {
                    tracing::debug!("Relay: receiver gone, envelope dropped");
                }
            }
            None => {
                tracing::debug!(
                    "Relay: no route for '{}', {} dropped",
                    envelope.to,
                    envelope.signal.action()
                );
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self
                .routes
                .lock()
                .get(&self.identity)
                .is_some_and(|route| route.token == self.token)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::Signal;

    #[tokio::test]
    async fn test_forwards_by_target() {
        let relay = LocalRelay::new();
        let (alice, _alice_in) = relay.connect("alice").unwrap();
        let (_bob, mut bob_in) = relay.connect("bob").unwrap();

        alice
            .send(Envelope::new("alice", "bob", Signal::CallEnd))
            .unwrap();
        // Unbekannter Empfänger: kein Fehler, nur verworfen
        alice
            .send(Envelope::new("alice", "carol", Signal::CallEnd))
            .unwrap();

        let received = bob_in.recv().await.unwrap();
        assert_eq!(received.from, "alice");
        assert_eq!(received.signal, Signal::CallEnd);
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream_and_closes_sink() {
        let relay = LocalRelay::new();
        let (alice, mut alice_in) = relay.connect("alice").unwrap();
        assert!(relay.is_connected("alice"));

        relay.disconnect("alice");

        assert!(alice_in.recv().await.is_none());
        assert!(!alice.is_open());
        assert_eq!(
            alice.send(Envelope::new("alice", "bob", Signal::CallEnd)),
            Err(SignalingError::NotConnected)
        );
    }

    #[test]
    fn test_one_channel_per_identity() {
        let relay = LocalRelay::new();
        let (_alice, _rx) = relay.connect("alice").unwrap();
        assert!(matches!(
            relay.connect("alice"),
            Err(SignalingError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_channel_does_not_touch_reconnected_identity() {
        let relay = LocalRelay::new();
        let (old, _old_in) = relay.connect("alice").unwrap();
        relay.disconnect("alice");

        let (current, mut current_in) = relay.connect("alice").unwrap();
        let (bob, _bob_in) = relay.connect("bob").unwrap();
        assert!(!old.is_open());
        assert!(current.is_open());

        old.close();
        assert!(current.is_open());
        assert!(relay.is_connected("alice"));

        bob.send(Envelope::new("bob", "alice", Signal::CallEnd))
            .unwrap();
        assert_eq!(current_in.recv().await.unwrap().from, "bob");
    }
}
