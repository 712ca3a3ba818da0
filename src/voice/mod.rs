//! Voice input and output
//!
//! Microphone capture, voice activity detection and ordered playback.
//! Device access goes through cpal; everything above the device seams
//! ([`PlaybackSink`], the capture frame handler) is device independent.

mod capture;
mod playback;
mod vad;

pub use capture::AudioCapture;
pub use playback::{
    ActiveSource, CompletionFn, CpalSink, DecodedAudio, PlaybackQueue, PlaybackSink,
    PlaybackUnit, UnitSink, decode_unit, resample,
};
pub use vad::{FrameDecision, VadEvent, VoiceActivityDetector, calculate_energy, samples_to_pcm16};
