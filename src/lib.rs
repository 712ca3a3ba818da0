//! Beacon Voice - real-time voice interaction pipeline
//!
//! This library turns a live microphone into speech turns for a voice server
//! and turns response text back into low-latency audio:
//! - Voice activity detection and barge-in
//! - Sentence segmentation of streamed response text
//! - Streaming speech synthesis over one persistent WebSocket
//! - Chunk batching and ordered, cancellable playback
//! - Session state reconciled with local playback
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   speech_start / PCM / speech_end   ┌──────────────────┐
//! │  Microphone │ ──► VAD ─────────────────────────► │   Voice server   │
//! └─────────────┘                                     │  (control plane) │
//!                        state / transcripts / audio  └────────┬─────────┘
//!                 ┌────────────────────────────────────────────┘
//!                 ▼
//! ┌──────────────────────────┐        ┌─────────────────────────────────┐
//! │       VoiceSession       │        │        ResponseSpeaker          │
//! │ state reconciler, events │        │ segmenter ─► synthesis client   │
//! │ barge-in, reconnection   │        │           ─► chunk batcher      │
//! └────────────┬─────────────┘        └───────────────┬─────────────────┘
//!              │                                      │
//!              ▼                                      ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                 PlaybackQueue ─► PlaybackSink (cpal)                 │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod speech;
pub mod synthesis;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{LoggingEvents, NoopEvents, VoiceEvents};
pub use session::{SessionState, VoiceSession};
pub use speech::{ChunkBatcher, ResponseSpeaker, SentenceSegmenter, SpeakReport};
pub use synthesis::{AudioChunk, SynthesisClient};
pub use voice::{
    AudioCapture, CpalSink, PlaybackQueue, PlaybackSink, PlaybackUnit, VoiceActivityDetector,
};
