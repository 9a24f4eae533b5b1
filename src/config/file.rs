//! TOML configuration file loading
//!
//! Supports `~/.config/voxturn/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::Fallback;
use crate::Result;
use crate::audio::SampleEncoding;
use crate::transport::Strategy;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoxturnConfigFile {
    /// Capture and wire sample format
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Utterance segmentation
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Remote endpoint and wire strategy
    #[serde(default)]
    pub transport: TransportFileConfig,

    /// Reply playback
    #[serde(default)]
    pub playback: PlaybackFileConfig,
}

/// Audio format configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Session sample rate in Hz (e.g. 16000)
    pub sample_rate: Option<u32>,

    /// Wire sample encoding ("f32" or "i16")
    pub encoding: Option<SampleEncoding>,

    /// Capture window in milliseconds
    pub frame_ms: Option<u32>,
}

/// Voice activity detection configuration
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub warmup_ms: Option<u64>,
    pub no_input_timeout_ms: Option<u64>,
    pub silence_after_speech_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub energy_threshold: Option<f32>,
}

/// Transport configuration
#[derive(Debug, Default, Deserialize)]
pub struct TransportFileConfig {
    /// Preferred strategy ("binary", "json", "http", "media")
    pub strategy: Option<Strategy>,

    /// Strategy tried once if the preferred one fails before any reply audio
    /// ("auto", "none" or a strategy name)
    pub fallback: Option<Fallback>,

    /// WebSocket endpoint (socket strategies and media signaling)
    pub endpoint: Option<String>,

    /// HTTP endpoint for the chunked strategy
    pub http_url: Option<String>,

    /// STUN/TURN server URLs for the media channel
    pub ice_servers: Option<Vec<String>>,

    /// Media channel handshake timeout
    pub handshake_timeout_ms: Option<u64>,

    /// Connect timeout for every strategy
    pub connect_timeout_ms: Option<u64>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub lead_in_ms: Option<u64>,
    pub prebuffer_seconds: Option<f64>,

    /// Force pre-buffering on or off; unset uses the strategy default
    pub prebuffer: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoxturnConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoxturnConfigFile {
    let Some(path) = config_file_path() else {
        return VoxturnConfigFile::default();
    };

    if !path.exists() {
        return VoxturnConfigFile::default();
    }

    match load_config_from(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            VoxturnConfigFile::default()
        }
    }
}

/// Load a config file from an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn load_config_from(path: &Path) -> Result<VoxturnConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/voxturn/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voxturn").join("config.toml"))
}
