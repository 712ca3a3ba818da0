//! Streaming synthesis client
//!
//! Owns one persistent WebSocket to the synthesis backend. Requests are
//! serialized through a single-permit semaphore so exactly one request is in
//! flight; inbound events are routed through a correlation table keyed by the
//! server-issued `request_id`. The backend assigns that id, so the first
//! event carrying an unknown id is bound to the request awaiting one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::AudioChunk;
use super::protocol::{SynthesisEvent, SynthesisRequest, parse_event};
use crate::config::SynthesisConfig;
use crate::{Error, Result};

type Route = mpsc::UnboundedSender<SynthesisEvent>;
type ConnectOutcome = std::result::Result<Arc<Connection>, Arc<Error>>;
type ConnectFuture = Shared<BoxFuture<'static, ConnectOutcome>>;

enum Link {
    Closed,
    Connecting { attempt: u64, future: ConnectFuture },
    Open(Arc<Connection>),
}

/// Correlation table: server request id -> per-request event channel
#[derive(Default)]
struct Routes {
    awaiting: Option<Route>,
    by_id: HashMap<String, Route>,
}

impl Routes {
    /// Find the handler for an event, binding unknown ids to the awaiting request
    fn route(&mut self, event: &SynthesisEvent) -> Option<Route> {
        let route = match event.request_id() {
            Some(id) => match self.by_id.get(id) {
                Some(route) => Some(route.clone()),
                None => self.awaiting.take().inspect(|route| {
                    self.by_id.insert(id.to_string(), route.clone());
                }),
            },
            None => self
                .awaiting
                .clone()
                .or_else(|| self.by_id.values().next().cloned()),
        };

        if event.is_terminal() {
            match event.request_id() {
                Some(id) => {
                    self.by_id.remove(id);
                }
                None => {
                    self.awaiting = None;
                    self.by_id.clear();
                }
            }
        }

        route
    }

    fn clear(&mut self) {
        self.awaiting = None;
        self.by_id.clear();
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    routes: Mutex<Routes>,
    closed: CancellationToken,
}

impl Connection {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::NotConnected);
        }
        self.outbound.send(message).map_err(|_| Error::NotConnected)
    }

    fn dispatch(&self, event: SynthesisEvent) {
        let route = self.routes().route(&event);
        match route {
            Some(route) => {
                let _ = route.send(event);
            }
            None => {
                tracing::debug!(
                    request_id = ?event.request_id(),
                    "dropping event for unknown request"
                );
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the socket; pending requests see their channel end
    fn close(&self) {
        self.closed.cancel();
        self.routes().clear();
    }
}

/// Client for the streaming synthesis backend
pub struct SynthesisClient {
    config: SynthesisConfig,
    link: Mutex<Link>,
    next_attempt: Mutex<u64>,
    in_flight: Arc<Semaphore>,
}

impl SynthesisClient {
    /// Create a client; no connection is made until [`Self::connect`]
    #[must_use]
    pub fn new(config: SynthesisConfig) -> Self {
        Self {
            config,
            link: Mutex::new(Link::Closed),
            next_attempt: Mutex::new(0),
            in_flight: Arc::new(Semaphore::new(1)),
        }
    }

    /// Open the connection
    ///
    /// Resolves immediately when already connected. Concurrent callers share
    /// a single connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionTimeout`] if the handshake does not finish
    /// within the configured window, or [`Error::Connection`] if it fails
    pub async fn connect(&self) -> Result<()> {
        let (attempt, future) = {
            let mut link = self.lock_link();
            match &*link {
                Link::Open(conn) if !conn.is_closed() => return Ok(()),
                Link::Connecting { attempt, future } => (*attempt, future.clone()),
                _ => {
                    let attempt = {
                        let mut next = self.next_attempt.lock().unwrap_or_else(|e| e.into_inner());
                        *next += 1;
                        *next
                    };
                    let future = open(self.config.url.clone(), self.config.connect_timeout)
                        .boxed()
                        .shared();
                    *link = Link::Connecting {
                        attempt,
                        future: future.clone(),
                    };
                    (attempt, future)
                }
            }
        };

        let outcome = future.await;

        let mut link = self.lock_link();
        let ours = matches!(&*link, Link::Connecting { attempt: a, .. } if *a == attempt);
        match outcome {
            Ok(conn) => {
                if ours {
                    *link = Link::Open(conn);
                    return Ok(());
                }
                if matches!(&*link, Link::Open(open) if Arc::ptr_eq(open, &conn)) {
                    return Ok(());
                }
                // disconnect() ran while the handshake was in progress
                conn.close();
                Err(Error::Disconnected)
            }
            Err(e) => {
                if ours {
                    *link = Link::Closed;
                }
                Err(shared_error(&e))
            }
        }
    }

    /// Send one request and stream its audio
    ///
    /// Waits until the previous request has finished; never reconnects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without an open connection
    pub async fn synthesize(&self, text: &str) -> Result<SynthesisStream> {
        if self.open_connection().is_none() {
            return Err(Error::NotConnected);
        }

        let permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| Error::Disconnected)?;
        let connection = self.open_connection().ok_or(Error::NotConnected)?;

        let (tx, rx) = mpsc::unbounded_channel();
        connection.routes().awaiting = Some(tx);

        let request = SynthesisRequest {
            text,
            voice_id: &self.config.voice_id,
            sample_rate: self.config.sample_rate,
            speed: self.config.speed,
        };
        let frame = serde_json::to_string(&request)?;
        if let Err(e) = connection.send(Message::Text(frame)) {
            connection.routes().awaiting = None;
            return Err(e);
        }

        tracing::debug!(chars = text.chars().count(), "synthesis request sent");

        Ok(SynthesisStream {
            events: rx,
            connection,
            request_id: None,
            finished: false,
            _permit: permit,
        })
    }

    /// Synthesize `text` and collect all of its audio
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent or the backend fails it
    pub async fn synthesize_all(&self, text: &str) -> Result<Vec<u8>> {
        let mut stream = self.synthesize(text).await?;
        let mut audio = Vec::new();
        while let Some(chunk) = stream.next().await {
            audio.extend_from_slice(&chunk?.data);
        }
        tracing::debug!(
            request_id = ?stream.request_id(),
            bytes = audio.len(),
            "batch synthesis complete"
        );
        Ok(audio)
    }

    /// Close the connection; safe to call repeatedly
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.lock_link(), Link::Closed);
        if let Link::Open(conn) = previous {
            conn.close();
            tracing::debug!("synthesis backend disconnected");
        }
    }

    /// Whether a usable connection is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.open_connection().is_some()
    }

    fn open_connection(&self) -> Option<Arc<Connection>> {
        match &*self.lock_link() {
            Link::Open(conn) if !conn.is_closed() => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SynthesisClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Audio stream for one in-flight request
///
/// Holds the in-flight permit; the next request starts once this is dropped.
/// Dropping it before the backend finished the request resets the
/// connection, since late events could otherwise be bound to the next one.
pub struct SynthesisStream {
    events: mpsc::UnboundedReceiver<SynthesisEvent>,
    connection: Arc<Connection>,
    request_id: Option<String>,
    finished: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for SynthesisStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisStream")
            .field("request_id", &self.request_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl SynthesisStream {
    /// Next chunk; `None` once the backend signalled completion
    pub async fn next(&mut self) -> Option<Result<AudioChunk>> {
        if self.finished {
            return None;
        }

        match self.events.recv().await {
            Some(SynthesisEvent::Chunk { request_id, audio }) => {
                if self.request_id.is_none() {
                    tracing::trace!(request_id = %request_id, "request bound");
                    self.request_id = Some(request_id.clone());
                }
                Some(Ok(AudioChunk {
                    request_id,
                    data: audio,
                }))
            }
            Some(SynthesisEvent::Complete { request_id }) => {
                self.request_id.get_or_insert(request_id);
                self.finished = true;
                None
            }
            Some(SynthesisEvent::Failed { message, .. }) => {
                self.finished = true;
                Some(Err(Error::Synthesis(message)))
            }
            None => {
                self.finished = true;
                Some(Err(Error::Disconnected))
            }
        }
    }

    /// Server-issued id, known once the first event arrived
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Whether the request reached a terminal event
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for SynthesisStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                request_id = ?self.request_id,
                "request abandoned, resetting synthesis connection"
            );
            self.connection.close();
        }
    }
}

async fn open(url: String, timeout: Duration) -> ConnectOutcome {
    let handshake = tokio_tungstenite::connect_async(url.as_str());
    let (ws, _response) = match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            tracing::warn!(url, error = %e, "synthesis connection failed");
            return Err(Arc::new(Error::Connection(e.to_string())));
        }
        Err(_) => {
            tracing::warn!(url, ?timeout, "synthesis connection timed out");
            return Err(Arc::new(Error::ConnectionTimeout(timeout)));
        }
    };

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(Connection {
        outbound,
        routes: Mutex::new(Routes::default()),
        closed: CancellationToken::new(),
    });
    tokio::spawn(drive(ws, Arc::clone(&connection), outbound_rx));

    tracing::info!(url, "synthesis backend connected");
    Ok(connection)
}

/// Pump the socket until either side closes it
async fn drive(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    connection: Arc<Connection>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            () = connection.closed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(error = %e, "synthesis send failed");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match parse_event(&text) {
                    Ok(event) => connection.dispatch(event),
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed synthesis frame");
                        connection.dispatch(SynthesisEvent::Failed {
                            request_id: None,
                            message: e.to_string(),
                        });
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "synthesis connection error");
                    break;
                }
            },
        }
    }

    connection.close();
    tracing::debug!("synthesis connection closed");
}

fn shared_error(error: &Error) -> Error {
    match error {
        Error::ConnectionTimeout(timeout) => Error::ConnectionTimeout(*timeout),
        Error::Connection(message) => Error::Connection(message.clone()),
        other => Error::Connection(other.to_string()),
    }
}
