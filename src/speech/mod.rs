//! Response text to playback units
//!
//! [`SentenceSegmenter`] cuts streamed text into sentence units,
//! [`ChunkBatcher`] groups synthesized audio into playback units and
//! [`ResponseSpeaker`] runs both around a
//! [`SynthesisClient`](crate::synthesis::SynthesisClient) for one turn.

mod batcher;
mod segmenter;
mod speaker;

pub use batcher::{ChunkBatcher, pcm16_to_wav};
pub use segmenter::SentenceSegmenter;
pub use speaker::{ResponseSpeaker, SpeakReport, SpeakerAbort};
