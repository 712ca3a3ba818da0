//! Configuration management for the voice pipeline
//!
//! Values are layered: built-in defaults, then the TOML file
//! (see [`file`]), then environment variables. CLI flags are applied
//! by the binary on top of the result.

pub mod file;

use std::path::Path;
use std::time::Duration;

use crate::Result;
use file::VoiceConfigFile;

/// Sample rate of microphone capture (16kHz mono for speech)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized audio and the output device
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Voice pipeline configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Control-plane connection
    pub control: ControlConfig,

    /// Control-plane reconnection policy
    pub reconnect: ReconnectPolicy,

    /// Voice activity detection
    pub vad: VadConfig,

    /// Sentence segmentation
    pub segmenter: SegmenterConfig,

    /// Speech synthesis backend
    pub synthesis: SynthesisConfig,

    /// Audio chunk batching
    pub batcher: BatcherConfig,

    /// Output device
    pub playback: PlaybackConfig,
}

/// Control-plane connection configuration
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// WebSocket URL of the voice server
    pub url: String,

    /// Driver identifier sent with `start_session`
    pub driver_id: Option<String>,

    /// Handshake timeout
    pub connect_timeout: Duration,

    /// Consecutive empty user transcripts before surfacing an error
    pub empty_transcript_limit: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:18790/voice".to_string(),
            driver_id: None,
            connect_timeout: Duration::from_secs(5),
            empty_transcript_limit: 3,
        }
    }
}

/// Bounded reconnection with linearly increasing delay
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts
    pub max_attempts: u32,
    /// Delay before the first attempt; attempt `n` waits `n * base_delay`
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1))
    }
}

/// Voice activity detection configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Samples per analysis frame
    pub frame_size: usize,
    /// RMS energy at or above which a frame counts as speech
    pub energy_threshold: f32,
    /// Consecutive speech frames needed to start an utterance
    pub speech_start_frames: u32,
    /// Consecutive silent frames needed to end an utterance
    pub silence_end_frames: u32,
    /// Minimum spacing between two `speech_start` signals
    pub debounce: Duration,
    /// Time after entering `listening` during which frames are ignored
    pub grace_period: Duration,
    /// Keep the detector armed while the assistant is speaking
    pub barge_in: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            energy_threshold: 0.02,
            speech_start_frames: 3,
            silence_end_frames: 20,
            debounce: Duration::from_millis(200),
            grace_period: Duration::from_millis(300),
            barge_in: false,
        }
    }
}

/// Sentence segmentation configuration
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Sentences shorter than this are carried into the next one
    pub min_sentence_chars: usize,
    /// Sentences shorter than this are merged with their neighbours
    pub merge_below_chars: usize,
    /// Merged units stop growing once they reach this length
    pub target_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_sentence_chars: 12,
            merge_below_chars: 20,
            target_chars: 80,
        }
    }
}

/// Synthesis backend configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// WebSocket URL of the synthesis backend
    pub url: String,
    /// Voice identifier
    pub voice_id: String,
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Speaking rate multiplier
    pub speed: f32,
    /// Handshake timeout
    pub connect_timeout: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8880/tts".to_string(),
            voice_id: "alloy".to_string(),
            sample_rate: PLAYBACK_SAMPLE_RATE,
            speed: 1.0,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Chunk batching configuration
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Chunks per batch after the first one
    pub batch_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self { batch_size: 3 }
    }
}

/// Output device configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Device sample rate in Hz
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: PLAYBACK_SAMPLE_RATE,
        }
    }
}

impl Config {
    /// Load configuration from the standard config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the loaded values are inconsistent
    pub fn load() -> Result<Self> {
        Self::from_file(file::load_config_file())
    }

    /// Load configuration from an explicit file path and environment
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load_from(path: &Path) -> Result<Self> {
        let file = file::read_config_file(path)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Self::from_file(file)
    }

    fn from_file(file: VoiceConfigFile) -> Result<Self> {
        let mut config = Self::default();
        config.apply_file(file);
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay values present in a config file
    pub fn apply_file(&mut self, file: VoiceConfigFile) {
        let VoiceConfigFile {
            control,
            reconnect,
            vad,
            segmenter,
            synthesis,
            batcher,
            playback,
        } = file;

        if let Some(url) = control.url {
            self.control.url = url;
        }
        if control.driver_id.is_some() {
            self.control.driver_id = control.driver_id;
        }
        if let Some(ms) = control.connect_timeout_ms {
            self.control.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = control.empty_transcript_limit {
            self.control.empty_transcript_limit = limit;
        }

        if let Some(n) = reconnect.max_attempts {
            self.reconnect.max_attempts = n;
        }
        if let Some(ms) = reconnect.base_delay_ms {
            self.reconnect.base_delay = Duration::from_millis(ms);
        }

        if let Some(n) = vad.frame_size {
            self.vad.frame_size = n;
        }
        if let Some(t) = vad.energy_threshold {
            self.vad.energy_threshold = t;
        }
        if let Some(n) = vad.speech_start_frames {
            self.vad.speech_start_frames = n;
        }
        if let Some(n) = vad.silence_end_frames {
            self.vad.silence_end_frames = n;
        }
        if let Some(ms) = vad.debounce_ms {
            self.vad.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = vad.grace_period_ms {
            self.vad.grace_period = Duration::from_millis(ms);
        }
        if let Some(b) = vad.barge_in {
            self.vad.barge_in = b;
        }

        if let Some(n) = segmenter.min_sentence_chars {
            self.segmenter.min_sentence_chars = n;
        }
        if let Some(n) = segmenter.merge_below_chars {
            self.segmenter.merge_below_chars = n;
        }
        if let Some(n) = segmenter.target_chars {
            self.segmenter.target_chars = n;
        }

        if let Some(url) = synthesis.url {
            self.synthesis.url = url;
        }
        if let Some(voice) = synthesis.voice_id {
            self.synthesis.voice_id = voice;
        }
        if let Some(rate) = synthesis.sample_rate {
            self.synthesis.sample_rate = rate;
        }
        if let Some(speed) = synthesis.speed {
            self.synthesis.speed = speed;
        }
        if let Some(ms) = synthesis.connect_timeout_ms {
            self.synthesis.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = batcher.batch_size {
            self.batcher.batch_size = n;
        }

        if let Some(rate) = playback.sample_rate {
            self.playback.sample_rate = rate;
        }
    }

    /// Overlay values from environment variables
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("BEACON_VOICE_URL") {
            self.control.url = url;
        }
        if let Ok(id) = std::env::var("BEACON_DRIVER_ID") {
            self.control.driver_id = Some(id);
        }
        if let Ok(url) = std::env::var("BEACON_SYNTHESIS_URL") {
            self.synthesis.url = url;
        }
        if let Ok(voice) = std::env::var("BEACON_TTS_VOICE") {
            self.synthesis.voice_id = voice;
        }
        if let Some(speed) = std::env::var("BEACON_TTS_SPEED")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.synthesis.speed = speed;
        }
    }

    /// Check that the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        use crate::Error;

        if self.vad.frame_size == 0 {
            return Err(Error::Config("vad.frame_size must be positive".to_string()));
        }
        if self.vad.speech_start_frames == 0 || self.vad.silence_end_frames == 0 {
            return Err(Error::Config(
                "vad frame counts must be positive".to_string(),
            ));
        }
        if self.batcher.batch_size == 0 {
            return Err(Error::Config(
                "batcher.batch_size must be positive".to_string(),
            ));
        }
        if self.segmenter.target_chars == 0 {
            return Err(Error::Config(
                "segmenter.target_chars must be positive".to_string(),
            ));
        }
        if !(0.25..=4.0).contains(&self.synthesis.speed) {
            return Err(Error::Config(format!(
                "synthesis.speed {} outside 0.25..=4.0",
                self.synthesis.speed
            )));
        }
        Ok(())
    }
}
