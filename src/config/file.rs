//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/voice.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Control-plane connection
    #[serde(default)]
    pub control: ControlFileConfig,

    /// Control-plane reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Sentence segmentation
    #[serde(default)]
    pub segmenter: SegmenterFileConfig,

    /// Speech synthesis backend
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Audio chunk batching
    #[serde(default)]
    pub batcher: BatcherFileConfig,

    /// Output device
    #[serde(default)]
    pub playback: PlaybackFileConfig,
}

/// Control-plane connection settings
#[derive(Debug, Default, Deserialize)]
pub struct ControlFileConfig {
    /// WebSocket URL of the voice server (e.g. "ws://localhost:18790/voice")
    pub url: Option<String>,

    /// Driver identifier sent with `start_session`
    pub driver_id: Option<String>,

    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Consecutive empty transcripts before surfacing a microphone error
    pub empty_transcript_limit: Option<u32>,
}

/// Reconnection settings
#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
}

/// Voice activity detection settings
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub frame_size: Option<usize>,
    pub energy_threshold: Option<f32>,
    pub speech_start_frames: Option<u32>,
    pub silence_end_frames: Option<u32>,
    pub debounce_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub barge_in: Option<bool>,
}

/// Sentence segmentation settings
#[derive(Debug, Default, Deserialize)]
pub struct SegmenterFileConfig {
    pub min_sentence_chars: Option<usize>,
    pub merge_below_chars: Option<usize>,
    pub target_chars: Option<usize>,
}

/// Synthesis backend settings
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    /// WebSocket URL of the synthesis backend
    pub url: Option<String>,

    /// Voice identifier (e.g. "alloy")
    pub voice_id: Option<String>,

    /// Output sample rate in Hz
    pub sample_rate: Option<u32>,

    /// Speaking rate multiplier
    pub speed: Option<f32>,

    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Chunk batching settings
#[derive(Debug, Default, Deserialize)]
pub struct BatcherFileConfig {
    pub batch_size: Option<usize>,
}

/// Output device settings
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub sample_rate: Option<u32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    let Some(path) = config_file_path() else {
        return VoiceConfigFile::default();
    };

    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match read_config_file(&path) {
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
            VoiceConfigFile::default()
        }
    }
}

/// Read and parse a specific config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<VoiceConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/omni/beacon/voice.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("voice.toml")
    })
}
