//! Konfiguration der Call-Komponenten
//!
//! Defaults funktionieren ohne weitere Angaben; einzelne Werte können über
//! Umgebungsvariablen (`PULSE_*`) oder ein JSON-Dokument überschrieben werden.

use crate::call_engine::CameraFacing;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
    ]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// URL des Signaling-Servers (http(s) oder ws(s))
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Kamera mit der ein Call startet
    pub default_camera: CameraFacing,
    /// Ob Video beim Start aktiviert ist
    pub start_with_video: bool,
    /// Optionales Timeout für Ringing/Connecting; `None` überlässt das dem Aufrufer
    pub ring_timeout_secs: Option<u64>,
    /// Keep-alive für den WebSocket (Idle-Timeouts der Relays)
    pub heartbeat_interval_secs: u64,
    pub register_timeout_secs: u64,
    /// Puffergröße des Event-Broadcasts
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "wss://localhost:8787".to_string(),
            ice_servers: default_ice_servers(),
            default_camera: CameraFacing::Front,
            start_with_video: true,
            ring_timeout_secs: None,
            heartbeat_interval_secs: 25,
            register_timeout_secs: 10,
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus den Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parst eine JSON-Konfiguration; fehlende Felder bekommen Defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("PULSE_SIGNALING_URL") {
            config.signaling_url = url;
        }

        if let Some(url) = lookup("PULSE_TURN_URL") {
            config.add_turn_server(
                url,
                lookup("PULSE_TURN_USERNAME").unwrap_or_default(),
                lookup("PULSE_TURN_CREDENTIAL").unwrap_or_default(),
            );
        }

        if let Some(value) = lookup("PULSE_RING_TIMEOUT_SECS") {
            let secs = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "PULSE_RING_TIMEOUT_SECS",
                    value: value.clone(),
                })?;
            config.ring_timeout_secs = Some(secs);
        }

        if let Some(value) = lookup("PULSE_DEFAULT_CAMERA") {
            config.default_camera = match value.trim().to_ascii_lowercase().as_str() {
                "front" => CameraFacing::Front,
                "back" => CameraFacing::Back,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "PULSE_DEFAULT_CAMERA",
                        value,
                    })
                }
            };
        }

        Ok(config)
    }

    /// Fügt TURN-Server Credentials hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        self.ring_timeout_secs.map(Duration::from_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_have_no_ring_timeout() {
        let config = CallConfig::default();
        assert_eq!(config.ring_timeout(), None);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.event_capacity, 100);
    }

    #[test]
    fn test_env_overrides() {
        let config = CallConfig::from_lookup(lookup(&[
            ("PULSE_SIGNALING_URL", "https://relay.example.org"),
            ("PULSE_TURN_URL", "turn:turn.example.org:3478"),
            ("PULSE_TURN_USERNAME", "alice"),
            ("PULSE_TURN_CREDENTIAL", "pw"),
            ("PULSE_RING_TIMEOUT_SECS", "45"),
            ("PULSE_DEFAULT_CAMERA", "Back"),
        ]))
        .unwrap();

        assert_eq!(config.signaling_url, "https://relay.example.org");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username, "alice");
        assert_eq!(config.ring_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.default_camera, CameraFacing::Back);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = CallConfig::from_lookup(lookup(&[("PULSE_RING_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "PULSE_RING_TIMEOUT_SECS",
                ..
            }
        ));
    }

    #[test]
    fn test_json_partial_config() {
        let config =
            CallConfig::from_json(r#"{"ring_timeout_secs": 30, "default_camera": "back"}"#)
                .unwrap();

        assert_eq!(config.ring_timeout_secs, Some(30));
        assert_eq!(config.default_camera, CameraFacing::Back);
        assert_eq!(config.heartbeat_interval_secs, 25);
    }
}
