//! Headless Agent
//!
//! `peer-call <identity> [peer] [audio|video]`
//!
//! Meldet `identity` am Relay an, ruft optional `peer` an und protokolliert
//! den Anrufzustand bis Ctrl-C. Mit `CALL_AUTO_ANSWER=1` werden eingehende
//! Anrufe automatisch angenommen.

use anyhow::{anyhow, Context, Result};
use peer_call::call_engine::CallEvent;
use peer_call::config::CallConfig;
use peer_call::signaling::CallType;
use peer_call::CallRuntime;
use tokio::sync::broadcast::error::RecvError;

const USAGE: &str = "usage: peer-call <identity> [peer] [audio|video]";

#[tokio::main]
async fn main() -> Result<()> {
    peer_call::init_logging();

    let mut args = std::env::args().skip(1);
    let identity = args.next().context(USAGE)?;
    let peer = args.next();
    let call_type = match args.next() {
        Some(kind) => kind.parse::<CallType>().map_err(|e| anyhow!("{}; {}", e, USAGE))?,
        None => CallType::Audio,
    };

    let config = CallConfig::from_env().context("Invalid configuration")?;
    let runtime = CallRuntime::connect(&config, &identity)
        .await
        .with_context(|| format!("Failed to connect as '{}'", identity))?;
    tracing::info!("Connected as '{}'", runtime.identity());

    let mut events = runtime.engine().subscribe();

    if let Some(peer) = peer {
        let target = runtime.call(&peer, call_type).await?;
        tracing::info!("Calling {} ({})", target, call_type);
    }

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
                break;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(CallEvent::IncomingCall { from, call_type }) => {
                tracing::info!("Incoming {} call from {}", call_type, from);
                if config.auto_answer {
                    if let Err(e) = runtime.engine().accept_call().await {
                        tracing::warn!("Auto-answer failed: {}", e);
                    }
                }
            }
            Ok(CallEvent::StateChanged(state)) => {
                let snapshot = runtime.engine().snapshot();
                tracing::info!(
                    "State {:?} (peer: {:?}, local tracks: {}, remote tracks: {})",
                    state,
                    snapshot.peer,
                    snapshot.local_tracks.len(),
                    snapshot.remote_tracks.len()
                );
            }
            Ok(CallEvent::Ended { peer, reason, .. }) => {
                tracing::info!("Call with {} ended: {:?}", peer, reason);
            }
            Ok(CallEvent::RemoteTrack(track)) => {
                tracing::info!("Receiving {:?} track {}", track.kind, track.id);
            }
            Ok(CallEvent::Error(e)) => tracing::warn!("{}", e),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Skipped {} call events", skipped);
            }
            Err(RecvError::Closed) => break,
        }

        if !runtime.is_connected() {
            tracing::error!("Signaling channel closed");
            break;
        }
    }

    runtime.shutdown().await;
    Ok(())
}
