//! Konfiguration für Sessions, Audio-Streaming und Signaling
//!
//! Frame-Größe, Ziel-Sample-Rate und Kadenz bilden eine gemeinsame
//! Konfiguration: die Kadenz wird immer aus Frame-Größe und Rate abgeleitet.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Standard Ziel-Sample-Rate des Transports
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Standard Frame-Größe (10ms @ 48kHz)
pub const DEFAULT_FRAME_SAMPLES: usize = 480;

/// Wartezeit auf Konnektivität, bevor die Session als gescheitert gilt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid stream configuration: {0}")]
    InvalidStream(String),

    #[error("Invalid relay URL: {0}")]
    InvalidRelayUrl(#[from] url::ParseError),

    #[error("Unsupported relay URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// STREAM CONFIG
// ============================================================================

/// Parameter für Resampling, Amplituden-Formung und Frame-Pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Sample-Rate, die der Transport erwartet
    pub target_sample_rate: u32,
    /// Samples pro Frame
    pub frame_sample_count: usize,
    /// Stretch-Faktor für den Playback-Cursor (1.0 = Echtzeit)
    pub playback_speed: f64,
    /// Verstärkung nach der Kompression
    pub gain: f32,
    /// Exponent der vorzeichenerhaltenden Kompression
    pub compression_exponent: f32,
    /// Am Ende der Quelle wieder von vorne beginnen
    pub loop_playback: bool,
    /// Aufeinanderfolgende Zustellfehler bis zum Abbruch
    pub max_consecutive_failures: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: DEFAULT_SAMPLE_RATE,
            frame_sample_count: DEFAULT_FRAME_SAMPLES,
            playback_speed: 1.0,
            gain: 2.0,
            compression_exponent: 0.8,
            loop_playback: false,
            max_consecutive_failures: 3,
        }
    }
}

impl StreamConfig {
    /// Lädt eine StreamConfig aus einer JSON-Datei; fehlende Felder bekommen Defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Prüft, ob die Parameter zueinander passen
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_sample_rate == 0 {
            return Err(ConfigError::InvalidStream(
                "target_sample_rate must be positive".to_string(),
            ));
        }
        if self.frame_sample_count == 0 {
            return Err(ConfigError::InvalidStream(
                "frame_sample_count must be positive".to_string(),
            ));
        }
        if !self.playback_speed.is_finite() || self.playback_speed <= 0.0 {
            return Err(ConfigError::InvalidStream(format!(
                "playback_speed must be a positive number, got {}",
                self.playback_speed
            )));
        }
        if !self.gain.is_finite() || self.gain < 0.0 {
            return Err(ConfigError::InvalidStream(format!(
                "gain must be a non-negative number, got {}",
                self.gain
            )));
        }
        if !self.compression_exponent.is_finite() || self.compression_exponent <= 0.0 {
            return Err(ConfigError::InvalidStream(format!(
                "compression_exponent must be positive, got {}",
                self.compression_exponent
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::InvalidStream(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Dauer eines Frames, abgeleitet aus Frame-Größe und Sample-Rate
    pub fn frame_duration(&self) -> Duration {
        let nanos =
            self.frame_sample_count as u128 * 1_000_000_000 / self.target_sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Zeitstempel (ms) des Frames mit dem gegebenen Index
    pub fn frame_timestamp_millis(&self, frame_index: u64) -> u64 {
        let samples = frame_index as u128 * self.frame_sample_count as u128;
        (samples * 1000 / self.target_sample_rate as u128) as u64
    }
}

// ============================================================================
// SESSION CONFIG
// ============================================================================

/// Einstellungen, die jede Call-Session mitbekommt
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub stream: StreamConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: StreamConfig::default(),
        }
    }
}

// ============================================================================
// APP CONFIG
// ============================================================================

/// Standard STUN Server (Google, kostenlos)
pub fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
    ]
}

/// Gesamte Konfiguration der Anwendung
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub relay_url: Url,
    pub audio_path: Option<std::path::PathBuf>,
    /// Rohes PCM: (Sample-Rate, Kanäle). `None` heißt WAV.
    pub raw_pcm: Option<(u32, u16)>,
    pub ice_servers: Vec<String>,
    pub auto_accept: bool,
    pub call_first: bool,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Parst und prüft die Relay-URL (ws, wss, http oder https)
    pub fn parse_relay_url(raw: &str) -> Result<Url, ConfigError> {
        let mut url = Url::parse(raw)?;
        let scheme = match url.scheme() {
            "ws" | "wss" => None,
            "http" => Some("ws"),
            "https" => Some("wss"),
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cadence_matches_frame_size() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_duration(), Duration::from_millis(10));
        assert_eq!(config.frame_timestamp_millis(3), 30);
    }

    #[test]
    fn test_cadence_follows_alternate_rate() {
        let config = StreamConfig {
            target_sample_rate: 44_100,
            frame_sample_count: 441,
            ..Default::default()
        };
        assert_eq!(config.frame_duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let zero_rate = StreamConfig {
            target_sample_rate: 0,
            ..Default::default()
        };
        assert!(zero_rate.validate().is_err());

        let bad_speed = StreamConfig {
            playback_speed: f64::NAN,
            ..Default::default()
        };
        assert!(bad_speed.validate().is_err());

        let negative_gain = StreamConfig {
            gain: -1.0,
            ..Default::default()
        };
        assert!(negative_gain.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StreamConfig =
            serde_json::from_str(r#"{ "playback_speed": 1.75, "loop_playback": true }"#).unwrap();
        assert_eq!(config.playback_speed, 1.75);
        assert!(config.loop_playback);
        assert_eq!(config.frame_sample_count, DEFAULT_FRAME_SAMPLES);
    }

    #[test]
    fn test_relay_url_scheme_mapping() {
        let url = AppConfig::parse_relay_url("https://relay.example.com/ws").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert!(AppConfig::parse_relay_url("ftp://relay.example.com").is_err());
    }
}
