//! Configuration management for voxturn

pub mod file;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::audio::{SAMPLE_RATE, SampleEncoding};
use crate::transport::{Strategy, WireFormat};
use crate::{Error, Result};

/// Default WebSocket endpoint of the remote agent
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws";

/// Default HTTP endpoint for the chunked strategy
pub const DEFAULT_HTTP_URL: &str = "http://127.0.0.1:8000/reply";

/// Default STUN server for the media channel
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Largest pre-buffer accepted, in seconds
const MAX_PREBUFFER_SECONDS: f64 = 60.0;

/// Longest capture window the energy estimator is meant to see
const MAX_FRAME_MS: u32 = 25;

/// Shortest lead-in that still leaves the output device time to start
const MIN_LEAD_IN_MS: u64 = 20;

/// voxturn configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Capture and wire sample format
    pub audio: AudioConfig,

    /// Utterance segmentation
    pub vad: VadConfig,

    /// Remote endpoint and wire strategy
    pub transport: TransportConfig,

    /// Reply playback
    pub playback: PlaybackConfig,
}

/// Audio format shared by capture, wire and playback
#[derive(Debug, Clone, Copy)]
pub struct AudioConfig {
    /// Session sample rate, agreed out of band with the remote endpoint
    pub sample_rate: u32,

    /// Canonical PCM representation on the wire
    pub encoding: SampleEncoding,

    /// Capture window in milliseconds
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            encoding: SampleEncoding::F32,
            frame_ms: 20,
        }
    }
}

impl AudioConfig {
    /// Number of samples in one capture window
    #[must_use]
    pub const fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Wire format for the transport layer
    #[must_use]
    pub const fn wire_format(&self) -> WireFormat {
        WireFormat {
            sample_rate: self.sample_rate,
            encoding: self.encoding,
        }
    }
}

/// Voice activity detection thresholds and timeouts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// Ambient noise estimation window at the start of each capture
    pub warmup_ms: u64,

    /// Give up if nobody speaks for this long
    pub no_input_timeout_ms: u64,

    /// Trailing silence that ends an utterance
    pub silence_after_speech_ms: u64,

    /// Hard cap on a single utterance
    pub max_duration_ms: u64,

    /// Static loudness threshold in [0, 1]
    pub energy_threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            warmup_ms: 500,
            no_input_timeout_ms: 5000,
            silence_after_speech_ms: 800,
            max_duration_ms: 30_000,
            energy_threshold: 0.01,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Preferred wire strategy
    pub strategy: Strategy,

    /// Strategy tried once when the preferred one fails before any reply audio
    pub fallback: Fallback,

    /// WebSocket endpoint (socket strategies and media signaling)
    pub endpoint: String,

    /// HTTP endpoint for the chunked strategy
    pub http_url: String,

    /// STUN/TURN servers handed to the peer connection
    pub ice_servers: Vec<String>,

    /// How long to wait for the remote answer on the media channel
    pub handshake_timeout_ms: u64,

    /// How long to wait for a connection to the remote endpoint
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Binary,
            fallback: Fallback::Auto,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            http_url: DEFAULT_HTTP_URL.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            handshake_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl TransportConfig {
    /// Connect timeout as a duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Fallback strategy once the preferred one is known
    #[must_use]
    pub fn fallback_strategy(&self) -> Option<Strategy> {
        self.fallback.resolve(self.strategy)
    }
}

/// Fallback setting as written in the config file, env or command line
///
/// `auto` picks chunked HTTP unless HTTP is already the preferred strategy.
/// `none` disables fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Fallback {
    #[default]
    Auto,
    Disabled,
    Strategy(Strategy),
}

impl Fallback {
    /// Strategy to fall back to when `preferred` fails
    #[must_use]
    pub fn resolve(self, preferred: Strategy) -> Option<Strategy> {
        match self {
            Self::Auto => (preferred != Strategy::Http).then_some(Strategy::Http),
            Self::Disabled => None,
            Self::Strategy(strategy) => Some(strategy),
        }
    }
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Disabled => f.write_str("none"),
            Self::Strategy(strategy) => write!(f, "{strategy}"),
        }
    }
}

impl FromStr for Fallback {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "" | "none" | "off" => Ok(Self::Disabled),
            other => Ok(Self::Strategy(other.parse()?)),
        }
    }
}

impl TryFrom<String> for Fallback {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Playback configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackConfig {
    /// Delay between "now" and the first scheduled sample
    pub lead_in_ms: u64,

    /// Audio to accumulate before starting playback when pre-buffering
    pub prebuffer_seconds: f64,

    /// Force pre-buffering on or off; `None` uses the strategy default
    pub prebuffer: Option<bool>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            lead_in_ms: MIN_LEAD_IN_MS,
            prebuffer_seconds: 1.5,
            prebuffer: None,
        }
    }
}

impl PlaybackConfig {
    /// Lead-in as a duration
    #[must_use]
    pub const fn lead_in(&self) -> Duration {
        Duration::from_millis(self.lead_in_ms)
    }

    /// Pre-buffer threshold for replies arriving over `strategy`
    ///
    /// Chunked HTTP replies are pre-buffered by default since the whole
    /// body tends to arrive in early bursts. A duration that does not fit a
    /// `Duration` disables pre-buffering.
    #[must_use]
    pub fn prebuffer_for(&self, strategy: Strategy) -> Option<Duration> {
        let enabled = self
            .prebuffer
            .unwrap_or_else(|| strategy.prebuffers_by_default());
        if !enabled {
            return None;
        }
        Duration::try_from_secs_f64(self.prebuffer_seconds).ok()
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if an environment override cannot be parsed or the
    /// resulting configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::from_file(fc).with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from a parsed config file, falling back to defaults
    #[must_use]
    pub fn from_file(fc: file::VoxturnConfigFile) -> Self {
        let defaults = Self::default();

        let audio = AudioConfig {
            sample_rate: fc.audio.sample_rate.unwrap_or(defaults.audio.sample_rate),
            encoding: fc.audio.encoding.unwrap_or(defaults.audio.encoding),
            frame_ms: fc.audio.frame_ms.unwrap_or(defaults.audio.frame_ms),
        };

        let vad = VadConfig {
            warmup_ms: fc.vad.warmup_ms.unwrap_or(defaults.vad.warmup_ms),
            no_input_timeout_ms: fc
                .vad
                .no_input_timeout_ms
                .unwrap_or(defaults.vad.no_input_timeout_ms),
            silence_after_speech_ms: fc
                .vad
                .silence_after_speech_ms
                .unwrap_or(defaults.vad.silence_after_speech_ms),
            max_duration_ms: fc
                .vad
                .max_duration_ms
                .unwrap_or(defaults.vad.max_duration_ms),
            energy_threshold: fc
                .vad
                .energy_threshold
                .unwrap_or(defaults.vad.energy_threshold),
        };

        let transport = TransportConfig {
            strategy: fc.transport.strategy.unwrap_or(defaults.transport.strategy),
            fallback: fc.transport.fallback.unwrap_or(defaults.transport.fallback),
            endpoint: fc.transport.endpoint.unwrap_or(defaults.transport.endpoint),
            http_url: fc.transport.http_url.unwrap_or(defaults.transport.http_url),
            ice_servers: fc
                .transport
                .ice_servers
                .unwrap_or(defaults.transport.ice_servers),
            handshake_timeout_ms: fc
                .transport
                .handshake_timeout_ms
                .unwrap_or(defaults.transport.handshake_timeout_ms),
            connect_timeout_ms: fc
                .transport
                .connect_timeout_ms
                .unwrap_or(defaults.transport.connect_timeout_ms),
        };

        let playback = PlaybackConfig {
            lead_in_ms: fc.playback.lead_in_ms.unwrap_or(defaults.playback.lead_in_ms),
            prebuffer_seconds: fc
                .playback
                .prebuffer_seconds
                .unwrap_or(defaults.playback.prebuffer_seconds),
            prebuffer: fc.playback.prebuffer,
        };

        Self {
            audio,
            vad,
            transport,
            playback,
        }
    }

    /// Apply `VOXTURN_*` environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if an override is present but malformed
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(endpoint) = std::env::var("VOXTURN_ENDPOINT") {
            self.transport.endpoint = endpoint;
        }
        if let Ok(url) = std::env::var("VOXTURN_HTTP_URL") {
            self.transport.http_url = url;
        }
        if let Ok(strategy) = std::env::var("VOXTURN_STRATEGY") {
            self.transport.strategy = strategy.parse()?;
        }
        if let Ok(fallback) = std::env::var("VOXTURN_FALLBACK") {
            self.transport.fallback = fallback.parse()?;
        }
        if let Ok(rate) = std::env::var("VOXTURN_SAMPLE_RATE") {
            self.audio.sample_rate = rate
                .parse()
                .map_err(|_| Error::Config(format!("invalid VOXTURN_SAMPLE_RATE: {rate}")))?;
        }
        if let Ok(encoding) = std::env::var("VOXTURN_ENCODING") {
            self.audio.encoding = encoding.parse()?;
        }
        Ok(self)
    }

    /// Check that the configuration describes a usable session
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("sample rate must be non-zero".to_string()));
        }
        if self.audio.frame_ms == 0 || self.audio.frame_ms > MAX_FRAME_MS {
            return Err(Error::Config(format!(
                "frame window must be between 1 and {MAX_FRAME_MS} ms, got {}",
                self.audio.frame_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.vad.energy_threshold) {
            return Err(Error::Config(format!(
                "energy threshold must be within [0, 1], got {}",
                self.vad.energy_threshold
            )));
        }
        if self.playback.lead_in_ms < MIN_LEAD_IN_MS {
            return Err(Error::Config(format!(
                "playback lead-in must be at least {MIN_LEAD_IN_MS} ms"
            )));
        }
        if !(0.0..=MAX_PREBUFFER_SECONDS).contains(&self.playback.prebuffer_seconds) {
            return Err(Error::Config(format!(
                "prebuffer duration must be between 0 and {MAX_PREBUFFER_SECONDS} seconds, got {}",
                self.playback.prebuffer_seconds
            )));
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err(Error::Config("connect timeout must be non-zero".to_string()));
        }
        if self.transport.fallback == Fallback::Strategy(self.transport.strategy) {
            return Err(Error::Config(format!(
                "fallback strategy must differ from the preferred one ({})",
                self.transport.strategy
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.audio.frame_samples(), 320);
        assert_eq!(config.vad.no_input_timeout_ms, 5000);
        assert_eq!(config.vad.max_duration_ms, 30_000);
        assert!((config.vad.energy_threshold - 0.01).abs() < f32::EPSILON);
    }

    #[test]
    fn file_values_override_defaults() {
        let fc: file::VoxturnConfigFile = toml::from_str(
            r#"
            [audio]
            sample_rate = 44100
            [transport]
            strategy = "media"
            ice_servers = ["stun:example.org:3478"]
            "#,
        )
        .unwrap();

        let config = Config::from_file(fc);
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.transport.strategy, Strategy::Media);
        assert_eq!(config.transport.ice_servers, vec!["stun:example.org:3478"]);
        // untouched sections keep their defaults
        assert_eq!(config.vad, VadConfig::default());
    }

    #[test]
    fn rejects_long_frames() {
        let mut config = Config::default();
        config.audio.frame_ms = 40;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_short_lead_in() {
        let mut config = Config::default();
        config.playback.lead_in_ms = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_fallback_equal_to_preferred() {
        let mut config = Config::default();
        config.transport.strategy = Strategy::Http;
        config.transport.fallback = Fallback::Strategy(Strategy::Http);
        assert!(config.validate().is_err());
    }

    #[test]
    fn http_preferred_drops_default_fallback() {
        let fc: file::VoxturnConfigFile =
            toml::from_str("[transport]\nstrategy = \"http\"\n").unwrap();

        let config = Config::from_file(fc);
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.fallback_strategy(), None);

        // Same outcome when the strategy arrives after loading, as a CLI override does
        let mut config = Config::default();
        assert_eq!(config.transport.fallback_strategy(), Some(Strategy::Http));
        config.transport.strategy = Strategy::Http;
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.fallback_strategy(), None);
    }

    #[test]
    fn fallback_setting_parses() {
        assert_eq!("none".parse::<Fallback>().unwrap(), Fallback::Disabled);
        assert_eq!("".parse::<Fallback>().unwrap(), Fallback::Disabled);
        assert_eq!("auto".parse::<Fallback>().unwrap(), Fallback::Auto);
        assert_eq!(
            "json".parse::<Fallback>().unwrap(),
            Fallback::Strategy(Strategy::Json)
        );
        assert!("carrier-pigeon".parse::<Fallback>().is_err());
        assert_eq!(Fallback::Disabled.resolve(Strategy::Binary), None);
        assert_eq!(
            Fallback::Strategy(Strategy::Json).resolve(Strategy::Media),
            Some(Strategy::Json)
        );
    }

    #[test]
    fn rejects_unbounded_prebuffer() {
        let mut config = Config::default();
        config.playback.prebuffer_seconds = 1e20;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.playback.prebuffer_seconds = f64::NAN;
        assert!(config.validate().is_err());

        config.playback.prebuffer_seconds = 60.0;
        assert!(config.validate().is_ok());

        // Never panics, even on values validation would reject
        let playback = PlaybackConfig {
            prebuffer_seconds: 1e20,
            prebuffer: Some(true),
            ..PlaybackConfig::default()
        };
        assert_eq!(playback.prebuffer_for(Strategy::Binary), None);
    }

    #[test]
    fn prebuffer_defaults_follow_strategy() {
        let playback = PlaybackConfig::default();
        assert_eq!(
            playback.prebuffer_for(Strategy::Http),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(playback.prebuffer_for(Strategy::Binary), None);

        let forced = PlaybackConfig {
            prebuffer: Some(true),
            ..PlaybackConfig::default()
        };
        assert!(forced.prebuffer_for(Strategy::Json).is_some());
    }
}
