//! Streaming speech synthesis transport
//!
//! [`SynthesisClient`] keeps one WebSocket open to the synthesis backend and
//! runs exactly one request at a time over it. Audio comes back as a
//! [`SynthesisStream`] of [`AudioChunk`]s tagged with the backend's request id.

pub mod client;
pub mod protocol;

pub use client::{SynthesisClient, SynthesisStream};
pub use protocol::{SynthesisEvent, SynthesisRequest, parse_event};

/// Raw 16-bit PCM belonging to one synthesis request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Server-issued request id
    pub request_id: String,
    /// Little-endian signed 16-bit mono samples
    pub data: Vec<u8>,
}
