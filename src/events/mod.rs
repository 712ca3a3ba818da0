//! Host callbacks
//!
//! A host application (dashboard, IVR bridge, test harness) implements
//! [`VoiceEvents`] to observe a session. Every method has a no-op default,
//! and implementations must not block: callbacks run on network tasks and,
//! for audio, inside the playback hand-off.

use crate::Error;
use crate::session::SessionState;

/// Callback set exposed to the host
pub trait VoiceEvents: Send + Sync {
    /// A playback unit (or server-sent audio) is ready
    fn on_audio_chunk(&self, _audio: &[u8], _correlation_id: &str) {}

    /// The visible session state changed
    fn on_state_change(&self, _state: SessionState) {}

    /// A transcript arrived; `role` is `user` or `assistant`
    fn on_transcript(&self, _role: &str, _text: &str) {}

    /// The server ran a tool on the caller's behalf
    fn on_tool_result(&self, _tool_name: &str, _result: &serde_json::Value) {}

    /// Something went wrong; the pipeline keeps running
    fn on_error(&self, _error: &Error) {}
}

/// Ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl VoiceEvents for NoopEvents {}

/// Reports events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEvents;

impl VoiceEvents for LoggingEvents {
    fn on_audio_chunk(&self, audio: &[u8], correlation_id: &str) {
        tracing::trace!(correlation_id, bytes = audio.len(), "audio");
    }

    fn on_state_change(&self, state: SessionState) {
        tracing::info!(%state, "session state");
    }

    fn on_transcript(&self, role: &str, text: &str) {
        tracing::info!(role, text, "transcript");
    }

    fn on_tool_result(&self, tool_name: &str, result: &serde_json::Value) {
        tracing::info!(tool = tool_name, %result, "tool result");
    }

    fn on_error(&self, error: &Error) {
        tracing::warn!(error = %error, "voice pipeline error");
    }
}
