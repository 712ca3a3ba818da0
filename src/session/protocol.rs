//! Control-plane messages exchanged with the voice server
//!
//! JSON text frames tagged by `type`. Captured speech travels separately as
//! binary frames of 16-bit PCM at 16 kHz mono.

use serde::{Deserialize, Serialize};

use super::SessionState;

/// Client -> server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a conversation
    StartSession {
        #[serde(
            rename = "driverId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        driver_id: Option<String>,
    },
    /// User started talking; PCM frames follow
    SpeechStart,
    /// User stopped talking
    SpeechEnd,
    /// Close the conversation
    EndSession,
}

/// Server -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Server-side state changed
    StateChange { state: SessionState },
    /// Recognized user speech or assistant text
    Transcript { role: String, text: String },
    /// Result of a tool the server ran
    ToolResult {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        result: serde_json::Value,
    },
    /// Synthesized response audio (base64)
    AudioChunk { audio: String },
    /// Short audio played while the server is thinking (base64)
    FillerAudio { audio: String },
    /// Server-side failure
    Error { message: String },
}
