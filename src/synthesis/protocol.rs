//! Wire format of the streaming synthesis backend
//!
//! Requests are JSON text frames `{text, voice_id, sample_rate, speed}`.
//! Responses are JSON text frames of three shapes:
//!
//! ```text
//! {"status": "chunk", "data": {"audio": "<base64>"}, "request_id": "..."}
//! {"status": "complete", "request_id": "..."}      ("comp" is accepted too)
//! {"error": "...", "request_id": "..."}            (request_id optional)
//! ```

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One synthesis request
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest<'a> {
    pub text: &'a str,
    pub voice_id: &'a str,
    pub sample_rate: u32,
    pub speed: f32,
}

/// Parsed backend event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// Audio for a request
    Chunk { request_id: String, audio: Vec<u8> },
    /// No more chunks for a request
    Complete { request_id: String },
    /// Backend failed a request
    Failed {
        request_id: Option<String>,
        message: String,
    },
}

impl SynthesisEvent {
    /// Request the event belongs to, when the backend said
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Chunk { request_id, .. } | Self::Complete { request_id } => Some(request_id),
            Self::Failed { request_id, .. } => request_id.as_deref(),
        }
    }

    /// Whether the event closes its request
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    data: Option<RawChunkData>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawChunkData {
    audio: String,
}

/// Parse one text frame from the backend
///
/// # Errors
///
/// Returns [`Error::Protocol`] for frames that match none of the known shapes
pub fn parse_event(text: &str) -> Result<SynthesisEvent> {
    let raw: RawEvent = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("invalid synthesis frame: {e}")))?;

    if let Some(error) = raw.error {
        let message = match error {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        return Ok(SynthesisEvent::Failed {
            request_id: raw.request_id,
            message,
        });
    }

    let request_id = raw
        .request_id
        .ok_or_else(|| Error::Protocol("synthesis frame without request_id".to_string()))?;

    match raw.status.as_deref() {
        Some("chunk") => {
            let data = raw
                .data
                .ok_or_else(|| Error::Protocol("chunk frame without data".to_string()))?;
            let audio = base64::engine::general_purpose::STANDARD
                .decode(data.audio.as_bytes())
                .map_err(|e| Error::Protocol(format!("chunk audio is not base64: {e}")))?;
            Ok(SynthesisEvent::Chunk { request_id, audio })
        }
        Some("complete" | "comp") => Ok(SynthesisEvent::Complete { request_id }),
        Some(other) => Err(Error::Protocol(format!("unknown synthesis status: {other}"))),
        None => Err(Error::Protocol("synthesis frame without status".to_string())),
    }
}
