//! Visible session state
//!
//! The state shown to the host is derived from two inputs: the state last
//! declared by the voice server and whether local playback has drained.
//! While audio is queued or playing, an active session reads `speaking`
//! whatever the server said, which also keeps the detector off until the
//! device has gone quiet.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Externally visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No control connection
    Disconnected,
    /// Control connection being (re)established
    Connecting,
    /// Waiting for the user to talk
    Listening,
    /// Server is working on a response
    Thinking,
    /// Assistant audio is playing
    Speaking,
}

impl SessionState {
    /// Whether the session is up and the server has taken over
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Listening | Self::Thinking | Self::Speaking)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        })
    }
}

/// A change of the visible state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

impl Transition {
    /// Whether this is the edge into `listening` that arms the grace period
    #[must_use]
    pub fn entered_listening(&self) -> bool {
        self.to == SessionState::Listening && self.from != SessionState::Listening
    }
}

/// Merges declared state and playback status into the visible state
#[derive(Debug)]
pub struct StateReconciler {
    declared: SessionState,
    playback_idle: bool,
    visible: SessionState,
}

impl Default for StateReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl StateReconciler {
    /// Start disconnected with nothing playing
    #[must_use]
    pub const fn new() -> Self {
        Self {
            declared: SessionState::Disconnected,
            playback_idle: true,
            visible: SessionState::Disconnected,
        }
    }

    /// Record a state declared by the server (or by the connection layer)
    pub fn declare(&mut self, state: SessionState, playback_idle: bool) -> Option<Transition> {
        self.declared = state;
        self.playback_idle = playback_idle;
        self.recompute()
    }

    /// Record a change in local playback
    pub fn playback_changed(&mut self, playback_idle: bool) -> Option<Transition> {
        self.playback_idle = playback_idle;
        self.recompute()
    }

    /// Current visible state
    #[must_use]
    pub const fn visible(&self) -> SessionState {
        self.visible
    }

    /// Last declared state
    #[must_use]
    pub const fn declared(&self) -> SessionState {
        self.declared
    }

    /// Whether playback had drained at the last update
    #[must_use]
    pub const fn is_playback_idle(&self) -> bool {
        self.playback_idle
    }

    fn recompute(&mut self) -> Option<Transition> {
        let next = if self.declared.is_active() && !self.playback_idle {
            SessionState::Speaking
        } else {
            self.declared
        };

        if next == self.visible {
            return None;
        }
        let transition = Transition {
            from: self.visible,
            to: next,
        };
        self.visible = next;
        Some(transition)
    }
}
