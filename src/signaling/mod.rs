//! Signaling Module - WebSocket-Kanal zum Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung pro Identität aufbauen und halten
//! - Envelopes serialisieren und senden
//! - Eingehende Envelopes parsen und als Stream liefern
//!

mod channel;
mod client;
mod messages;
mod relay;

pub use channel::{SignalInbound, SignalingError, SignalingSink};
pub use client::SignalingClient;
pub use messages::*;
pub use relay::{LocalChannel, LocalRelay};
