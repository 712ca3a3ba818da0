//! Voice session over the control connection
//!
//! [`VoiceSession`] owns everything that belongs to one call: the control
//! WebSocket, the detector, the playback queue it feeds, the visible state
//! and the reconnect counter. Dropping it (or calling [`VoiceSession::end`])
//! tears the call down deliberately; only an unexpected connection loss
//! starts the bounded reconnection loop.
//!
//! ```text
//!  mic frames ─► handle_frame ─► VAD ─► speech_start / PCM / speech_end ─┐
//!                                                                        ▼
//!  host events ◄─ state / transcripts / tool results ◄──────────── control socket
//!                                                                        │
//!  PlaybackQueue ◄──────────────── audio_chunk / filler_audio ◄──────────┘
//! ```

mod protocol;
mod state;

pub use protocol::{ClientMessage, ServerMessage};
pub use state::{SessionState, StateReconciler, Transition};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, ControlConfig};
use crate::events::VoiceEvents;
use crate::speech::{ResponseSpeaker, SpeakerAbort};
use crate::synthesis::SynthesisClient;
use crate::voice::{PlaybackQueue, PlaybackUnit, VadEvent, VoiceActivityDetector};
use crate::{Error, Result};

type ControlSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frame queued for the control connection
#[derive(Debug)]
enum Outbound {
    Control(ClientMessage),
    Audio(Vec<u8>),
}

/// Why a control connection stopped
enum ConnectionEnd {
    Deliberate,
    Lost(String),
}

#[derive(Default)]
struct Counters {
    empty_transcripts: u32,
    reconnect_attempts: u32,
    server_units: u32,
}

struct SessionInner {
    id: Uuid,
    config: Config,
    events: Arc<dyn VoiceEvents>,
    playback: PlaybackQueue,
    reconciler: Mutex<StateReconciler>,
    vad: Mutex<VoiceActivityDetector>,
    counters: Mutex<Counters>,
    speaker: Mutex<Option<SpeakerAbort>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    ended: CancellationToken,
    finished: CancellationToken,
}

/// One voice call
pub struct VoiceSession {
    inner: Arc<SessionInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceSession {
    /// Connect to the voice server and start the session
    ///
    /// # Errors
    ///
    /// Returns error if the control connection cannot be opened; the session
    /// is then left `disconnected` and no reconnection is attempted
    pub async fn connect(
        config: Config,
        playback: PlaybackQueue,
        events: Arc<dyn VoiceEvents>,
    ) -> Result<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            id: Uuid::new_v4(),
            vad: Mutex::new(VoiceActivityDetector::new(config.vad.clone())),
            config,
            events,
            playback,
            reconciler: Mutex::new(StateReconciler::new()),
            counters: Mutex::new(Counters::default()),
            speaker: Mutex::new(None),
            outbound,
            ended: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        tracing::info!(
            session_id = %inner.id,
            url = %inner.config.control.url,
            "starting voice session"
        );
        inner.declare(SessionState::Connecting);

        let socket = match inner.open().await {
            Ok(socket) => socket,
            Err(e) => {
                inner.declare(SessionState::Disconnected);
                inner.finished.cancel();
                return Err(e);
            }
        };

        let task = tokio::spawn(Arc::clone(&inner).run(socket, outbound_rx));
        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Visible state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.reconciler().visible()
    }

    /// State last declared by the server
    #[must_use]
    pub fn declared_state(&self) -> SessionState {
        self.inner.reconciler().declared()
    }

    /// Reconnection attempts made since the connection was last healthy
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.counters().reconnect_attempts
    }

    /// Playback queue fed by this session
    #[must_use]
    pub fn playback(&self) -> &PlaybackQueue {
        &self.inner.playback
    }

    /// Feed one microphone frame
    ///
    /// Runs the detector and queues the resulting signals; never blocks on
    /// the network.
    pub fn handle_frame(&self, samples: &[f32]) {
        self.inner.handle_frame(samples);
    }

    /// Frame handler for [`crate::voice::AudioCapture::start`]
    #[must_use]
    pub fn frame_handler(&self) -> impl FnMut(&[f32]) + Send + 'static + use<> {
        let inner = Arc::clone(&self.inner);
        move |samples: &[f32]| inner.handle_frame(samples)
    }

    /// Stop assistant audio now, as if the user had started talking
    pub fn interrupt(&self) {
        self.inner.barge_in();
    }

    /// Register the speaker of the current turn so barge-in can cancel it
    pub fn attach_speaker(&self, speaker: SpeakerAbort) {
        *self
            .inner
            .speaker
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(speaker);
    }

    /// Start a locally synthesized turn that plays through this session
    ///
    /// The speaker is attached, so barge-in and [`Self::end`] cancel it.
    #[must_use]
    pub fn speak(&self, client: Arc<SynthesisClient>) -> ResponseSpeaker {
        let config = &self.inner.config;
        let speaker = ResponseSpeaker::start(
            client,
            Arc::new(self.inner.playback.clone()),
            Arc::clone(&self.inner.events),
            &config.segmenter,
            &config.batcher,
            config.synthesis.sample_rate,
        );
        self.attach_speaker(speaker.abort_handle());
        speaker
    }

    /// End the session deliberately; no reconnection follows
    pub async fn end(&self) {
        if !self.inner.ended.is_cancelled() {
            tracing::info!(session_id = %self.inner.id, "ending voice session");
            self.inner.cancel_turn();
            self.inner.ended.cancel();
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "voice session task failed");
            }
        }
    }

    /// Wait until the session has stopped, deliberately or not
    pub async fn closed(&self) {
        self.inner.finished.cancelled().await;
    }

    /// Whether the session has stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.finished.is_cancelled()
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if !self.inner.ended.is_cancelled() {
            self.inner.cancel_turn();
            self.inner.ended.cancel();
        }
    }
}

impl SessionInner {
    fn reconciler(&self) -> MutexGuard<'_, StateReconciler> {
        self.reconciler.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn vad(&self) -> MutexGuard<'_, VoiceActivityDetector> {
        self.vad.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, message: Outbound) {
        // the receiver lives as long as the session task
        let _ = self.outbound.send(message);
    }

    async fn open(&self) -> Result<ControlSocket> {
        let mut socket = open_control(&self.config.control).await?;
        let start = ClientMessage::StartSession {
            driver_id: self.config.control.driver_id.clone(),
        };
        socket
            .send(Message::Text(serde_json::to_string(&start)?))
            .await?;
        tracing::debug!(session_id = %self.id, "session started");
        Ok(socket)
    }

    async fn run(
        self: Arc<Self>,
        mut socket: ControlSocket,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        loop {
            let reason = match self.drive(socket, &mut outbound).await {
                ConnectionEnd::Deliberate => break,
                ConnectionEnd::Lost(reason) => reason,
            };

            tracing::warn!(session_id = %self.id, reason, "control connection lost");
            self.events.on_error(&Error::Disconnected);
            self.cancel_turn();
            self.declare(SessionState::Connecting);

            match self.reconnect(&mut outbound).await {
                Some(next) => socket = next,
                None => break,
            }
        }

        self.cancel_turn();
        self.declare(SessionState::Disconnected);
        self.finished.cancel();
        tracing::info!(session_id = %self.id, "voice session closed");
    }

    /// Pump one control connection until it closes
    async fn drive(
        &self,
        socket: ControlSocket,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> ConnectionEnd {
        let (mut sink, mut stream) = socket.split();
        let mut idle = self.playback.subscribe();

        loop {
            tokio::select! {
                biased;
                () = self.ended.cancelled() => {
                    if let Ok(text) = serde_json::to_string(&ClientMessage::EndSession) {
                        let _ = sink.send(Message::Text(text)).await;
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectionEnd::Deliberate;
                }
                Ok(()) = idle.changed() => self.reconcile(),
                frame = outbound.recv() => {
                    let message = match frame {
                        Some(Outbound::Control(message)) => match serde_json::to_string(&message) {
                            Ok(text) => Message::Text(text),
                            Err(e) => {
                                tracing::error!(error = %e, "failed to encode control message");
                                continue;
                            }
                        },
                        Some(Outbound::Audio(pcm)) => Message::Binary(pcm),
                        None => return ConnectionEnd::Deliberate,
                    };
                    if let Err(e) = sink.send(message).await {
                        return ConnectionEnd::Lost(e.to_string());
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_server_text(&text),
                    Some(Ok(Message::Binary(data))) => {
                        tracing::trace!(bytes = data.len(), "ignoring binary control frame");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return ConnectionEnd::Lost("closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return ConnectionEnd::Lost(e.to_string()),
                },
            }
        }
    }

    /// Bounded reconnection with linearly growing delay
    async fn reconnect(
        &self,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Option<ControlSocket> {
        let policy = &self.config.reconnect;

        for attempt in 1..=policy.max_attempts {
            self.counters().reconnect_attempts = attempt;
            let delay = policy.delay_for_attempt(attempt);
            tracing::info!(
                session_id = %self.id,
                attempt,
                max_attempts = policy.max_attempts,
                ?delay,
                "reconnecting"
            );

            let opened = tokio::select! {
                biased;
                () = self.ended.cancelled() => return None,
                opened = async {
                    tokio::time::sleep(delay).await;
                    self.open().await
                } => opened,
            };

            match opened {
                Ok(socket) => {
                    // frames queued while offline belong to the lost connection
                    let mut stale = 0usize;
                    while outbound.try_recv().is_ok() {
                        stale += 1;
                    }
                    if stale > 0 {
                        tracing::debug!(stale, "dropped frames queued while offline");
                    }
                    self.counters().reconnect_attempts = 0;
                    tracing::info!(session_id = %self.id, attempt, "reconnected");
                    return Some(socket);
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.id, attempt, error = %e, "reconnect failed");
                    self.events.on_error(&e);
                }
            }
        }

        let err = Error::ReconnectExhausted {
            attempts: policy.max_attempts,
        };
        tracing::error!(session_id = %self.id, error = %err, "giving up on control connection");
        self.events.on_error(&err);
        None
    }

    fn handle_server_text(&self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                let err = Error::Protocol(format!("invalid control message: {e}"));
                tracing::warn!(error = %err, "dropping control message");
                self.events.on_error(&err);
                return;
            }
        };

        match message {
            ServerMessage::StateChange { state } => {
                tracing::debug!(session_id = %self.id, %state, "server state");
                self.declare(state);
            }
            ServerMessage::Transcript { role, text } => {
                self.events.on_transcript(&role, &text);
                if role == "user" {
                    self.count_transcript(&text);
                }
            }
            ServerMessage::ToolResult { tool_name, result } => {
                tracing::debug!(tool = %tool_name, "tool result");
                self.events.on_tool_result(&tool_name, &result);
            }
            ServerMessage::AudioChunk { audio } => self.play_server_audio("response", &audio),
            ServerMessage::FillerAudio { audio } => self.play_server_audio("filler", &audio),
            ServerMessage::Error { message } => {
                tracing::warn!(session_id = %self.id, message, "server error");
                self.events.on_error(&Error::Server(message));
            }
        }
    }

    fn play_server_audio(&self, kind: &str, encoded: &str) {
        let audio = match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(audio) => audio,
            Err(e) => {
                let err = Error::Protocol(format!("{kind} audio is not base64: {e}"));
                tracing::warn!(error = %err, "dropping server audio");
                self.events.on_error(&err);
                return;
            }
        };

        let sequence = {
            let mut counters = self.counters();
            let sequence = counters.server_units;
            counters.server_units = counters.server_units.wrapping_add(1);
            sequence
        };

        self.events.on_audio_chunk(&audio, kind);
        self.playback.enqueue(PlaybackUnit {
            correlation_id: kind.to_string(),
            sequence,
            audio,
        });
        self.reconcile();
    }

    fn count_transcript(&self, text: &str) {
        let limit = self.config.control.empty_transcript_limit;
        let mut counters = self.counters();
        if !text.trim().is_empty() {
            counters.empty_transcripts = 0;
            return;
        }

        counters.empty_transcripts += 1;
        let count = counters.empty_transcripts;
        tracing::debug!(count, limit, "empty transcript");
        if limit > 0 && count >= limit {
            counters.empty_transcripts = 0;
            drop(counters);
            self.events.on_error(&Error::NoSpeechInput { count });
        }
    }

    fn handle_frame(&self, samples: &[f32]) {
        let decision = self.vad().process(samples, Instant::now());

        match decision.event {
            Some(VadEvent::SpeechStart) => {
                if !self.playback.is_idle() {
                    self.barge_in();
                }
                self.send(Outbound::Control(ClientMessage::SpeechStart));
            }
            Some(VadEvent::SpeechEnd) => {
                self.send(Outbound::Control(ClientMessage::SpeechEnd));
            }
            None => {}
        }

        if let Some(pcm) = decision.pcm {
            self.send(Outbound::Audio(pcm));
        }
    }

    fn barge_in(&self) {
        tracing::debug!(
            session_id = %self.id,
            pending = self.playback.pending_len(),
            "barge-in"
        );
        self.cancel_turn();
        self.reconcile();
    }

    /// Drop all assistant audio of the current turn
    fn cancel_turn(&self) {
        let speaker = self
            .speaker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(speaker) = speaker {
            speaker.abort();
        }
        self.playback.clear();
    }

    fn declare(&self, state: SessionState) {
        // lock order: reconciler, then playback queue
        let transition = {
            let mut reconciler = self.reconciler();
            reconciler.declare(state, self.playback.is_idle())
        };
        if let Some(transition) = transition {
            self.apply(transition);
        }
    }

    fn reconcile(&self) {
        let transition = {
            let mut reconciler = self.reconciler();
            reconciler.playback_changed(self.playback.is_idle())
        };
        if let Some(transition) = transition {
            self.apply(transition);
        }
    }

    fn apply(&self, transition: Transition) {
        tracing::debug!(
            session_id = %self.id,
            from = %transition.from,
            to = %transition.to,
            "state transition"
        );

        let armed = transition.to == SessionState::Listening
            || (self.config.vad.barge_in && transition.to == SessionState::Speaking);
        let closing = {
            let mut vad = self.vad();
            let closing = vad.set_enabled(armed);
            if transition.entered_listening() {
                vad.start_grace(Instant::now());
            }
            closing
        };
        if closing == Some(VadEvent::SpeechEnd) && transition.to.is_active() {
            self.send(Outbound::Control(ClientMessage::SpeechEnd));
        }

        self.events.on_state_change(transition.to);
    }
}

/// Open a control WebSocket within the configured timeout
async fn open_control(config: &ControlConfig) -> Result<ControlSocket> {
    let handshake = tokio_tungstenite::connect_async(config.url.as_str());
    match tokio::time::timeout(config.connect_timeout, handshake).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(Error::Connection(e.to_string())),
        Err(_) => Err(Error::ConnectionTimeout(config.connect_timeout)),
    }
}

/// Watch the visible state of a session through its host events
///
/// Convenience for hosts that prefer polling over callbacks.
#[must_use]
pub fn state_channel() -> (StateEvents, watch::Receiver<SessionState>) {
    let (tx, rx) = watch::channel(SessionState::Disconnected);
    (StateEvents { tx }, rx)
}

/// [`VoiceEvents`] implementation publishing state changes on a watch channel
pub struct StateEvents {
    tx: watch::Sender<SessionState>,
}

impl VoiceEvents for StateEvents {
    fn on_state_change(&self, state: SessionState) {
        self.tx.send_replace(state);
    }
}
