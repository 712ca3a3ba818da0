//! Shared test utilities
//!
//! Loopback servers for both WebSocket protocols plus recording
//! implementations of the device and host seams, so the pipeline can be
//! exercised end to end without audio hardware.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use beacon_voice::config::CAPTURE_SAMPLE_RATE;
use beacon_voice::voice::{
    decode_unit, ActiveSource, CompletionFn, PlaybackSink, PlaybackUnit, UnitSink,
};
use beacon_voice::{Error, SessionState, VoiceEvents};

/// Generate sine wave audio samples at the capture rate
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (CAPTURE_SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / CAPTURE_SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (CAPTURE_SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// PCM the loopback synthesis backend returns for `text`
pub fn pattern_for(text: &str) -> Vec<u8> {
    text.bytes().flat_map(|b| [b, 0x01]).collect()
}

/// Loopback synthesis backend
///
/// Answers each request with [`pattern_for`] its text, split into chunks of
/// `chunk_bytes`, then a completion event. Text containing `FAIL` gets an
/// error event, `STALL` stops after one chunk without completing and `DROP`
/// closes the connection after one chunk.
pub struct SynthesisBackend {
    pub url: String,
    requests: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl SynthesisBackend {
    pub async fn start() -> Self {
        Self::start_with_chunk_size(6).await
    }

    pub async fn start_with_chunk_size(chunk_bytes: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let requests = Arc::clone(&requests);
            let connections = Arc::clone(&connections);
            let counter = Arc::new(AtomicUsize::new(0));
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let requests = Arc::clone(&requests);
                    let connections = Arc::clone(&connections);
                    let counter = Arc::clone(&counter);
                    tokio::spawn(async move {
                        let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                            return;
                        };
                        connections.fetch_add(1, Ordering::SeqCst);
                        serve_synthesis(ws, chunk_bytes, &requests, &counter).await;
                    });
                }
            })
        };

        Self {
            url,
            requests,
            connections,
            task,
        }
    }

    /// Texts received, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Completed WebSocket handshakes
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for SynthesisBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_synthesis(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    chunk_bytes: usize,
    requests: &Mutex<Vec<String>>,
    counter: &AtomicUsize,
) {
    let (mut tx, mut rx) = ws.split();

    while let Some(Ok(message)) = rx.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request: serde_json::Value = serde_json::from_str(&text).unwrap();
        let body = request["text"].as_str().unwrap_or_default().to_string();
        requests.lock().unwrap().push(body.clone());

        let n = counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("req-{n}");

        if body.contains("FAIL") {
            let frame = serde_json::json!({ "error": "synthesis failed", "request_id": id });
            if tx.send(Message::Text(frame.to_string())).await.is_err() {
                return;
            }
            continue;
        }

        let stall = body.contains("STALL");
        let drop_connection = body.contains("DROP");
        for (i, chunk) in pattern_for(&body).chunks(chunk_bytes).enumerate() {
            if i == 1 && drop_connection {
                return;
            }
            if i == 1 && stall {
                break;
            }
            let frame = serde_json::json!({
                "status": "chunk",
                "data": { "audio": base64::engine::general_purpose::STANDARD.encode(chunk) },
                "request_id": id,
            });
            if tx.send(Message::Text(frame.to_string())).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        if stall {
            continue;
        }

        let status = if n % 2 == 0 { "complete" } else { "comp" };
        let frame = serde_json::json!({ "status": status, "request_id": id });
        if tx.send(Message::Text(frame.to_string())).await.is_err() {
            return;
        }
    }
}

/// Frame received by the loopback control server
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Json(serde_json::Value),
    Binary(usize),
}

enum ServerCommand {
    Send(Message),
    Drop,
}

/// Loopback voice server for the control plane
pub struct ControlServer {
    pub url: String,
    frames: Arc<Mutex<Vec<ControlFrame>>>,
    connections: Arc<AtomicUsize>,
    reject: Arc<AtomicUsize>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<ServerCommand>>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/voice", listener.local_addr().unwrap());
        let frames = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let reject = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(Mutex::new(None));

        let task = {
            let frames = Arc::clone(&frames);
            let connections = Arc::clone(&connections);
            let reject = Arc::clone(&reject);
            let current = Arc::clone(&current);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    if reject
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        drop(stream);
                        continue;
                    }
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        continue;
                    };
                    let (commands, commands_rx) = mpsc::unbounded_channel();
                    *current.lock().unwrap() = Some(commands);
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_control(ws, commands_rx, Arc::clone(&frames)));
                }
            })
        };

        Self {
            url,
            frames,
            connections,
            reject,
            current,
            accept_task: Mutex::new(Some(task)),
        }
    }

    /// Send a JSON message on the current connection
    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.command(ServerCommand::Send(Message::Text(value.to_string())))
    }

    /// Send `audio` as a base64 `audio_chunk` (or `filler_audio`) message
    pub fn send_audio(&self, kind: &str, audio: &[u8]) -> bool {
        self.send_json(serde_json::json!({
            "type": kind,
            "audio": base64::engine::general_purpose::STANDARD.encode(audio),
        }))
    }

    /// Declare a server state
    pub fn send_state(&self, state: &str) -> bool {
        self.send_json(serde_json::json!({ "type": "state_change", "state": state }))
    }

    /// Send raw text on the current connection
    pub fn send_raw(&self, text: &str) -> bool {
        self.command(ServerCommand::Send(Message::Text(text.to_string())))
    }

    /// Close the current connection without a closing handshake
    pub fn drop_connection(&self) -> bool {
        self.command(ServerCommand::Drop)
    }

    /// Fail the next `n` handshakes
    pub fn reject_next(&self, n: usize) {
        self.reject.store(n, Ordering::SeqCst);
    }

    /// Stop listening; further connection attempts are refused
    pub async fn stop_accepting(&self) {
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    /// Completed WebSocket handshakes
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Everything received so far
    pub fn frames(&self) -> Vec<ControlFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// `type` of every JSON message received, in order
    pub fn message_types(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                ControlFrame::Json(value) => value["type"].as_str().map(ToString::to_string),
                ControlFrame::Binary(_) => None,
            })
            .collect()
    }

    /// Number of binary audio frames received
    pub fn binary_frames(&self) -> usize {
        self.frames()
            .iter()
            .filter(|frame| matches!(frame, ControlFrame::Binary(_)))
            .count()
    }

    fn command(&self, command: ServerCommand) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.send(command).is_ok())
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        self.command(ServerCommand::Drop);
    }
}

async fn serve_control(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
    frames: Arc<Mutex<Vec<ControlFrame>>>,
) {
    let (mut tx, mut rx) = ws.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ServerCommand::Send(message)) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Drop) | None => break,
            },
            message = rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let value = serde_json::from_str(&text).unwrap();
                    frames.lock().unwrap().push(ControlFrame::Json(value));
                }
                Some(Ok(Message::Binary(data))) => {
                    frames.lock().unwrap().push(ControlFrame::Binary(data.len()));
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Output device stand-in
///
/// Automatic sinks finish every source right away from another thread;
/// manual sinks wait for [`RecordingSink::complete_next`].
pub struct RecordingSink {
    automatic: bool,
    played: Mutex<Vec<Vec<f32>>>,
    rates: Mutex<Vec<u32>>,
    pending: Mutex<Vec<CompletionFn>>,
    stopped: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn automatic() -> Arc<Self> {
        Arc::new(Self::new(true))
    }

    pub fn manual() -> Arc<Self> {
        Arc::new(Self::new(false))
    }

    fn new(automatic: bool) -> Self {
        Self {
            automatic,
            played: Mutex::new(Vec::new()),
            rates: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn played_count(&self) -> usize {
        self.played.lock().unwrap().len()
    }

    /// Rate each source was started at
    pub fn played_rates(&self) -> Vec<u32> {
        self.rates.lock().unwrap().clone()
    }

    /// Sample count of each source started so far
    pub fn played_lengths(&self) -> Vec<usize> {
        self.played.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn stopped_count(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Samples played so far, converted back to 16-bit PCM
    #[allow(clippy::cast_possible_truncation)]
    pub fn played_pcm(&self) -> Vec<u8> {
        self.played
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .flat_map(|&s| ((s * 32768.0) as i16).to_le_bytes())
            .collect()
    }

    /// Report the oldest unfinished source as done
    pub fn complete_next(&self) -> bool {
        let done = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        done();
        true
    }

    /// Report every unfinished source as done, including ones started meanwhile
    pub fn complete_all(&self) {
        while self.complete_next() {}
    }
}

struct RecordingSource {
    stopped: Arc<AtomicUsize>,
}

impl ActiveSource for RecordingSource {
    fn stop(&mut self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

impl PlaybackSink for RecordingSink {
    fn play(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        done: CompletionFn,
    ) -> beacon_voice::Result<Box<dyn ActiveSource>> {
        self.played.lock().unwrap().push(samples);
        self.rates.lock().unwrap().push(sample_rate);
        if self.automatic {
            std::thread::spawn(done);
        } else {
            self.pending.lock().unwrap().push(done);
        }
        Ok(Box::new(RecordingSource {
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

/// Unit sink that keeps everything it is handed
#[derive(Default)]
pub struct RecordingUnitSink {
    units: Mutex<Vec<PlaybackUnit>>,
    clears: AtomicUsize,
}

impl RecordingUnitSink {
    pub fn units(&self) -> Vec<PlaybackUnit> {
        self.units.lock().unwrap().clone()
    }

    /// PCM payload of every unit, decoded, in delivery order
    #[allow(clippy::cast_possible_truncation)]
    pub fn payload(&self) -> Vec<u8> {
        self.units
            .lock()
            .unwrap()
            .iter()
            .flat_map(|unit| decode_unit(&unit.audio, 24_000).unwrap().samples)
            .flat_map(|s| ((s * 32768.0) as i16).to_le_bytes())
            .collect()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl UnitSink for RecordingUnitSink {
    fn deliver(&self, unit: PlaybackUnit) {
        self.units.lock().unwrap().push(unit);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Host callbacks recorded for assertions
#[derive(Default)]
pub struct RecordingEvents {
    states: Mutex<Vec<SessionState>>,
    errors: Mutex<Vec<String>>,
    transcripts: Mutex<Vec<(String, String)>>,
    tools: Mutex<Vec<(String, serde_json::Value)>>,
    audio: Mutex<Vec<(usize, String)>>,
}

impl RecordingEvents {
    pub fn states(&self) -> Vec<SessionState> {
        self.states.lock().unwrap().clone()
    }

    pub fn last_state(&self) -> Option<SessionState> {
        self.states.lock().unwrap().last().copied()
    }

    /// Debug renderings of reported errors
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn errors_matching(&self, needle: &str) -> usize {
        self.errors().iter().filter(|e| e.contains(needle)).count()
    }

    pub fn transcripts(&self) -> Vec<(String, String)> {
        self.transcripts.lock().unwrap().clone()
    }

    pub fn tools(&self) -> Vec<(String, serde_json::Value)> {
        self.tools.lock().unwrap().clone()
    }

    pub fn audio(&self) -> Vec<(usize, String)> {
        self.audio.lock().unwrap().clone()
    }
}

impl VoiceEvents for RecordingEvents {
    fn on_audio_chunk(&self, audio: &[u8], correlation_id: &str) {
        self.audio
            .lock()
            .unwrap()
            .push((audio.len(), correlation_id.to_string()));
    }

    fn on_state_change(&self, state: SessionState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_transcript(&self, role: &str, text: &str) {
        self.transcripts
            .lock()
            .unwrap()
            .push((role.to_string(), text.to_string()));
    }

    fn on_tool_result(&self, tool_name: &str, result: &serde_json::Value) {
        self.tools
            .lock()
            .unwrap()
            .push((tool_name.to_string(), result.clone()));
    }

    fn on_error(&self, error: &Error) {
        self.errors.lock().unwrap().push(format!("{error:?}"));
    }
}
