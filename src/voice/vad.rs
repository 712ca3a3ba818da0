//! Voice activity detection
//!
//! Classifies fixed-size microphone frames as speech or silence from their
//! RMS energy and turns runs of frames into `speech_start` / `speech_end`
//! edges. The detector is a plain state machine: the caller supplies the
//! clock, so it can run inside a real-time capture callback and in tests.

use std::time::Instant;

use crate::config::VadConfig;

/// Edge emitted when the detector changes state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// User started talking
    SpeechStart,
    /// User stopped talking
    SpeechEnd,
}

/// Result of feeding one frame to the detector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameDecision {
    /// State edge triggered by this frame, if any
    pub event: Option<VadEvent>,
    /// 16-bit PCM for the frame when it belongs to an utterance
    pub pcm: Option<Vec<u8>>,
}

/// Energy-based voice activity detector
#[derive(Debug)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    speech_frames: u32,
    silence_frames: u32,
    speaking: bool,
    enabled: bool,
    grace_until: Option<Instant>,
    last_start: Option<Instant>,
}

impl VoiceActivityDetector {
    /// Create a detector; it starts disabled until the session is listening
    #[must_use]
    pub const fn new(config: VadConfig) -> Self {
        Self {
            config,
            speech_frames: 0,
            silence_frames: 0,
            speaking: false,
            enabled: false,
            grace_until: None,
            last_start: None,
        }
    }

    /// Feed one frame of float samples captured at `now`
    pub fn process(&mut self, samples: &[f32], now: Instant) -> FrameDecision {
        if !self.enabled || self.in_grace(now) {
            return FrameDecision::default();
        }

        let energy = calculate_energy(samples);
        if energy >= self.config.energy_threshold {
            self.speech_frames = self.speech_frames.saturating_add(1);
            self.silence_frames = 0;
        } else {
            self.silence_frames = self.silence_frames.saturating_add(1);
            self.speech_frames = 0;
        }

        let mut event = None;
        if !self.speaking && self.speech_frames >= self.config.speech_start_frames {
            let debounced = self
                .last_start
                .is_some_and(|t| now.duration_since(t) < self.config.debounce);
            if debounced {
                tracing::trace!(energy, "speech start debounced");
            } else {
                self.speaking = true;
                self.last_start = Some(now);
                event = Some(VadEvent::SpeechStart);
                tracing::debug!(energy, "speech started");
            }
        } else if self.speaking && self.silence_frames >= self.config.silence_end_frames {
            self.speaking = false;
            event = Some(VadEvent::SpeechEnd);
            tracing::debug!("speech ended");
        }

        let pcm = self.speaking.then(|| samples_to_pcm16(samples));
        FrameDecision { event, pcm }
    }

    /// Enable or disable the detector
    ///
    /// Disabling mid-utterance returns the closing [`VadEvent::SpeechEnd`].
    pub fn set_enabled(&mut self, enabled: bool) -> Option<VadEvent> {
        if self.enabled == enabled {
            return None;
        }
        self.enabled = enabled;
        if enabled {
            return None;
        }

        let was_speaking = self.speaking;
        self.reset_counters();
        was_speaking.then_some(VadEvent::SpeechEnd)
    }

    /// Start the echo-settling grace period at `now`
    pub fn start_grace(&mut self, now: Instant) {
        self.grace_until = Some(now + self.config.grace_period);
        self.speech_frames = 0;
        self.silence_frames = 0;
    }

    /// Forget the current utterance without emitting any edge
    pub fn reset(&mut self) {
        self.reset_counters();
        self.last_start = None;
    }

    fn reset_counters(&mut self) {
        self.speaking = false;
        self.speech_frames = 0;
        self.silence_frames = 0;
    }

    fn in_grace(&self, now: Instant) -> bool {
        self.grace_until.is_some_and(|until| now < until)
    }

    /// Whether an utterance is in progress
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Whether frames are currently analysed
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert f32 samples in [-1.0, 1.0] to little-endian 16-bit PCM
#[must_use]
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        pcm.extend_from_slice(&value.to_le_bytes());
    }
    pcm
}
