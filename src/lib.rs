//! Peer Call - P2P Audio/Video Anrufe
//!
//! Zustandsautomat für Zwei-Personen-Anrufe mit:
//! - WebSocket-Relay als Signaling-Kanal
//! - WebRTC für die Medienverbindung
//! - SQLite für lokale Kontakte

pub mod call_engine;
pub mod config;
pub mod directory;
pub mod signaling;

use call_engine::{
    CallEngine, CallError, DeviceMediaSource, EngineSettings, MediaSource, RtcTransportFactory,
    TransportFactory,
};
use config::{CallConfig, ConfigError};
use directory::{ContactBook, Directory, DirectoryError};
use once_cell::sync::OnceCell;
use signaling::{CallType, Signal, SignalingClient, SignalingError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

pub use call_engine::{CallEvent, CallSnapshot, CallState};

// ============================================================================
// LOGGING
// ============================================================================

static LOGGING: OnceCell<()> = OnceCell::new();

/// Installiert den tracing Subscriber (einmalig).
///
/// Filter aus `RUST_LOG`, sonst `peer_call=debug,webrtc=warn`.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peer_call=debug,webrtc=warn"));
        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global subscriber already installed");
        }
    });
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Call(#[from] CallError),
}

// ============================================================================
// CALL RUNTIME
// ============================================================================

/// Austauschbare Kollaborateure der Runtime
pub struct RuntimeParts {
    pub media: Arc<dyn MediaSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub directory: Arc<dyn Directory>,
}

impl RuntimeParts {
    /// Gerätemedien, WebRTC und das Kontaktbuch aus der Konfiguration
    pub fn from_config(config: &CallConfig) -> Result<Self, RuntimeError> {
        let book = ContactBook::open(config.contacts_db.as_deref())?;
        let directory: Arc<dyn Directory> = Arc::new(book);
        Ok(Self {
            media: Arc::new(DeviceMediaSource::new()),
            transports: Arc::new(RtcTransportFactory::new(&config.ice_servers)),
            directory,
        })
    }
}

/// Eine angemeldete Identität: Signaling-Verbindung, Call Engine und
/// Kontaktbuch
pub struct CallRuntime {
    client: Arc<SignalingClient>,
    engine: CallEngine,
    directory: Arc<dyn Directory>,
    pump: JoinHandle<()>,
}

impl CallRuntime {
    /// Verbindet `identity` mit dem Relay aus `config`
    pub async fn connect(config: &CallConfig, identity: &str) -> Result<Self, RuntimeError> {
        let parts = RuntimeParts::from_config(config)?;
        Self::connect_with(config, identity, parts).await
    }

    pub async fn connect_with(
        config: &CallConfig,
        identity: &str,
        parts: RuntimeParts,
    ) -> Result<Self, RuntimeError> {
        tracing::info!("Connecting '{}' to {}", identity, config.signaling_host);

        let (client, inbound) = SignalingClient::connect(config, identity).await?;
        let client = Arc::new(client);

        let engine = CallEngine::spawn(
            identity,
            client.clone(),
            parts.media,
            parts.transports,
            EngineSettings::from(config),
        );

        let directory = Arc::clone(&parts.directory);
        let pump = engine.pump_with(inbound, move |envelope| {
            if !marks_presence(&envelope.signal) {
                return;
            }
            if let Err(e) = directory.record_seen(&envelope.from) {
                tracing::warn!("Failed to record '{}' as seen: {}", envelope.from, e);
            }
        });

        Ok(Self {
            client,
            engine,
            directory: parts.directory,
            pump,
        })
    }

    pub fn identity(&self) -> &str {
        self.engine.identity()
    }

    pub fn engine(&self) -> &CallEngine {
        &self.engine
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Ruft `name` an (Identität oder Anzeigename aus dem Kontaktbuch)
    pub async fn call(&self, name: &str, call_type: CallType) -> Result<String, RuntimeError> {
        let identity = self.directory.resolve(name)?;
        self.engine.start_call(&identity, call_type).await?;
        Ok(identity)
    }

    /// Legt einen laufenden Anruf auf und schließt die Verbindung
    pub async fn shutdown(self) {
        match self.engine.hang_up().await {
            Ok(()) | Err(CallError::NoActiveCall) => {}
            Err(e) => tracing::warn!("Hang up during shutdown failed: {}", e),
        }

        self.client.close();
        if !self.client.wait_closed(Duration::from_secs(2)).await {
            tracing::warn!("Signaling channel did not close in time");
        }
        if tokio::time::timeout(Duration::from_secs(2), self.pump).await.is_err() {
            tracing::warn!("Inbound pump did not stop in time");
        }
        tracing::info!("Runtime for '{}' shut down", self.engine.identity());
    }
}

/// Nur Anrufaufbau zählt als Anwesenheit, nicht jeder ICE Candidate
fn marks_presence(signal: &Signal) -> bool {
    matches!(signal, Signal::CallRequest { .. } | Signal::Offer { .. })
}

// ============================================================================
// TESTS
// ============================================================================
