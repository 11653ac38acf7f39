//! Konfiguration
//!
//! Alle Einstellungen haben Defaults und können über Umgebungsvariablen
//! überschrieben werden (`CALL_SIGNALING_HOST`, `CALL_STUN_URLS`, ...).

use crate::signaling::is_valid_identity;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid signaling host '{0}'")]
    InvalidHost(String),

    #[error("Invalid identity '{0}'")]
    InvalidIdentity(String),
}

// ============================================================================
// ICE SERVERS
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server (Google, kostenlos)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// `host[:port]` des Relays, ohne Schema
    pub signaling_host: String,
    /// `wss` statt `ws`
    pub secure: bool,
    pub ice_servers: Vec<IceServerConfig>,
    /// Wie lange `Ended` sichtbar bleibt, bevor wieder `Idle` gilt
    pub ended_linger_ms: u64,
    /// Intervall für WebSocket-Pings
    pub keepalive_secs: u64,
    /// Pfad des Kontaktbuchs, sonst das App-Datenverzeichnis
    pub contacts_db: Option<PathBuf>,
    /// Eingehende Anrufe automatisch annehmen (Agent)
    pub auto_answer: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_host: "localhost:8000".to_string(),
            secure: false,
            ice_servers: default_ice_servers(),
            ended_linger_ms: 500,
            keepalive_secs: 25,
            contacts_db: None,
            auto_answer: false,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus den Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Wie [`CallConfig::from_env`], mit beliebiger Quelle für die Variablen
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("CALL_SIGNALING_HOST") {
            let host = host.trim().trim_end_matches('/').to_string();
            if host.is_empty() || host.contains("://") {
                return Err(ConfigError::InvalidHost(host));
            }
            config.signaling_host = host;
        }

        if let Some(secure) = lookup("CALL_SIGNALING_SECURE") {
            config.secure = parse_bool("CALL_SIGNALING_SECURE", &secure)?;
        }

        if let Some(stun) = lookup("CALL_STUN_URLS") {
            let urls: Vec<String> = stun
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
            config.ice_servers = if urls.is_empty() {
                Vec::new()
            } else {
                vec![IceServerConfig {
                    urls,
                    username: String::new(),
                    credential: String::new(),
                }]
            };
        }

        if let Some(turn_url) = lookup("CALL_TURN_URL") {
            config.ice_servers.push(IceServerConfig {
                urls: vec![turn_url.trim().to_string()],
                username: lookup("CALL_TURN_USERNAME").unwrap_or_default(),
                credential: lookup("CALL_TURN_CREDENTIAL").unwrap_or_default(),
            });
        }

        if let Some(linger) = lookup("CALL_ENDED_LINGER_MS") {
            config.ended_linger_ms = parse_u64("CALL_ENDED_LINGER_MS", &linger)?;
        }

        if let Some(keepalive) = lookup("CALL_KEEPALIVE_SECS") {
            let secs = parse_u64("CALL_KEEPALIVE_SECS", &keepalive)?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "CALL_KEEPALIVE_SECS",
                    value: keepalive,
                });
            }
            config.keepalive_secs = secs;
        }

        if let Some(auto_answer) = lookup("CALL_AUTO_ANSWER") {
            config.auto_answer = parse_bool("CALL_AUTO_ANSWER", &auto_answer)?;
        }

        if let Some(path) = lookup("CALL_CONTACTS_DB") {
            config.contacts_db = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    pub fn ended_linger(&self) -> Duration {
        Duration::from_millis(self.ended_linger_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    /// Adresse des Signaling-Endpunkts: `ws(s)://<host>/ws/call/<identity>/`
    pub fn signaling_url(&self, identity: &str) -> Result<Url, ConfigError> {
        if !is_valid_identity(identity) {
            return Err(ConfigError::InvalidIdentity(identity.to_string()));
        }

        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{}://{}/", scheme, self.signaling_host))
            .map_err(|_| ConfigError::InvalidHost(self.signaling_host.clone()))?;

        url.path_segments_mut()
            .map_err(|_| ConfigError::InvalidHost(self.signaling_host.clone()))?
            .clear()
            .extend(["ws", "call", identity, ""]);

        Ok(url)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_signaling_url() {
        let config = CallConfig::default();
        let url = config.signaling_url("alice").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/call/alice/");
    }

    #[test]
    fn test_signaling_url_is_encoded_and_secure() {
        let config = CallConfig {
            signaling_host: "pms.example.com".to_string(),
            secure: true,
            ..Default::default()
        };
        let url = config.signaling_url("jürgen").unwrap();
        assert_eq!(url.as_str(), "wss://pms.example.com/ws/call/j%C3%BCrgen/");
    }

    #[test]
    fn test_signaling_url_rejects_bad_identity() {
        let config = CallConfig::default();
        assert_eq!(
            config.signaling_url("a/b"),
            Err(ConfigError::InvalidIdentity("a/b".to_string()))
        );
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = CallConfig::from_lookup(lookup(&[
            ("CALL_SIGNALING_HOST", "relay.local:9000/"),
            ("CALL_SIGNALING_SECURE", "true"),
            ("CALL_STUN_URLS", "stun:a:3478, stun:b:3478"),
            ("CALL_TURN_URL", "turn:t:3478"),
            ("CALL_TURN_USERNAME", "u"),
            ("CALL_TURN_CREDENTIAL", "p"),
            ("CALL_ENDED_LINGER_MS", "20"),
            ("CALL_AUTO_ANSWER", "1"),
        ]))
        .unwrap();

        assert_eq!(config.signaling_host, "relay.local:9000");
        assert!(config.secure);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:a:3478", "stun:b:3478"]);
        assert_eq!(config.ice_servers[1].username, "u");
        assert_eq!(config.ended_linger(), Duration::from_millis(20));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(25));
        assert!(config.auto_answer);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = CallConfig::from_lookup(lookup(&[("CALL_SIGNALING_SECURE", "maybe")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));

        let err = CallConfig::from_lookup(lookup(&[("CALL_SIGNALING_HOST", "ws://x")]));
        assert!(matches!(err, Err(ConfigError::InvalidHost(_))));

        let err = CallConfig::from_lookup(lookup(&[("CALL_KEEPALIVE_SECS", "0")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }
}
