//! Response speaker
//!
//! Drives one assistant turn from streamed text to playback units:
//! fragments go through the [`SentenceSegmenter`], finished sentences are
//! queued for a background worker which synthesizes them strictly one at a
//! time, batches the audio and hands units to a [`UnitSink`].
//!
//! The worker is an explicit task with a [`CancellationToken`].
//! [`ResponseSpeaker::finish`] awaits its [`SpeakReport`];
//! [`ResponseSpeaker::abort`] (or a cloned [`SpeakerAbort`]) cancels it and
//! clears the sink. Delivery and abort share one lock, so once `abort`
//! returns no further unit reaches the sink.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ChunkBatcher, SentenceSegmenter};
use crate::config::{BatcherConfig, SegmenterConfig};
use crate::events::VoiceEvents;
use crate::synthesis::SynthesisClient;
use crate::voice::{PlaybackUnit, UnitSink};
use crate::Result;

/// Outcome of one spoken turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeakReport {
    /// Sentences whose audio was fully delivered
    pub sentences_spoken: usize,
    /// Sentences abandoned after a synthesis error
    pub sentences_failed: usize,
    /// Playback units handed to the sink
    pub units_delivered: usize,
    /// Raw PCM bytes received from the backend
    pub audio_bytes: usize,
    /// Whether the turn was cancelled
    pub aborted: bool,
}

struct DeliveryGate {
    aborted: Mutex<bool>,
    sink: Arc<dyn UnitSink>,
    events: Arc<dyn VoiceEvents>,
}

impl DeliveryGate {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.aborted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand a unit to the sink unless the turn was aborted
    fn deliver(&self, unit: PlaybackUnit) -> bool {
        let aborted = self.lock();
        if *aborted {
            return false;
        }
        self.events
            .on_audio_chunk(&unit.audio, &unit.correlation_id);
        self.sink.deliver(unit);
        true
    }

    fn abort(&self) -> bool {
        let mut aborted = self.lock();
        let first = !*aborted;
        *aborted = true;
        self.sink.clear();
        first
    }
}

/// Cloneable handle that cancels a speaker's turn
#[derive(Clone)]
pub struct SpeakerAbort {
    cancel: CancellationToken,
    gate: Arc<DeliveryGate>,
    segmenter: Arc<Mutex<SentenceSegmenter>>,
}

impl SpeakerAbort {
    /// Stop the turn: drop buffered text, pending sentences, batched audio
    /// and everything already handed to the sink
    pub fn abort(&self) {
        self.segmenter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort();
        self.cancel.cancel();
        if self.gate.abort() {
            tracing::debug!("response speaker aborted");
        }
    }

    /// Whether the turn was cancelled
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Speaks one streamed response
pub struct ResponseSpeaker {
    control: SpeakerAbort,
    sentences: Mutex<Option<mpsc::UnboundedSender<String>>>,
    worker: Mutex<Option<JoinHandle<SpeakReport>>>,
}

impl ResponseSpeaker {
    /// Start a turn; the worker connects the client before the first sentence
    #[must_use]
    pub fn start(
        client: Arc<SynthesisClient>,
        sink: Arc<dyn UnitSink>,
        events: Arc<dyn VoiceEvents>,
        segmenter: &SegmenterConfig,
        batcher: &BatcherConfig,
        sample_rate: u32,
    ) -> Self {
        let cancel = CancellationToken::new();
        let gate = Arc::new(DeliveryGate {
            aborted: Mutex::new(false),
            sink,
            events: Arc::clone(&events),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            client,
            gate: Arc::clone(&gate),
            events,
            cancel: cancel.clone(),
            batcher: ChunkBatcher::new(batcher, sample_rate),
            report: SpeakReport::default(),
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            control: SpeakerAbort {
                cancel,
                gate,
                segmenter: Arc::new(Mutex::new(SentenceSegmenter::new(segmenter.clone()))),
            },
            sentences: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Feed a fragment of response text
    pub fn push_text(&self, fragment: &str) {
        let units = self.segmenter().push(fragment);
        self.enqueue(units);
    }

    /// Signal the end of the response and wait for its audio to be delivered
    pub async fn finish(self) -> SpeakReport {
        let units = self.segmenter().finish();
        self.enqueue(units);
        self.sentences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "speaker worker failed");
                SpeakReport {
                    aborted: true,
                    ..SpeakReport::default()
                }
            }),
            None => SpeakReport::default(),
        }
    }

    /// Cancel the turn immediately
    pub fn abort(&self) {
        self.control.abort();
    }

    /// Handle for cancelling this turn from elsewhere (barge-in)
    #[must_use]
    pub fn abort_handle(&self) -> SpeakerAbort {
        self.control.clone()
    }

    fn segmenter(&self) -> MutexGuard<'_, SentenceSegmenter> {
        self.control
            .segmenter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, units: Vec<String>) {
        if units.is_empty() {
            return;
        }
        let sentences = self.sentences.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = sentences.as_ref() {
            for unit in units {
                let _ = tx.send(unit);
            }
        }
    }
}

impl Drop for ResponseSpeaker {
    fn drop(&mut self) {
        let running = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        if running {
            self.control.abort();
        }
    }
}

enum Step {
    Done,
    Aborted,
}

struct Worker {
    client: Arc<SynthesisClient>,
    gate: Arc<DeliveryGate>,
    events: Arc<dyn VoiceEvents>,
    cancel: CancellationToken,
    batcher: ChunkBatcher,
    report: SpeakReport,
}

impl Worker {
    async fn run(mut self, mut sentences: mpsc::UnboundedReceiver<String>) -> SpeakReport {
        let connected = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return self.aborted(),
            result = self.client.connect() => result,
        };
        if let Err(e) = connected {
            tracing::warn!(error = %e, "synthesis unavailable, dropping turn");
            self.events.on_error(&e);
            return self.report;
        }

        loop {
            let sentence = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.aborted(),
                sentence = sentences.recv() => match sentence {
                    Some(sentence) => sentence,
                    None => break,
                },
            };

            match self.speak(&sentence).await {
                Ok(Step::Done) => self.report.sentences_spoken += 1,
                Ok(Step::Aborted) => return self.aborted(),
                Err(e) => {
                    self.batcher.reset();
                    self.report.sentences_failed += 1;
                    tracing::warn!(error = %e, "sentence synthesis failed");
                    self.events.on_error(&e);
                    if e.is_connection() {
                        return self.report;
                    }
                }
            }
        }

        tracing::debug!(
            spoken = self.report.sentences_spoken,
            failed = self.report.sentences_failed,
            units = self.report.units_delivered,
            "response spoken"
        );
        self.report
    }

    async fn speak(&mut self, sentence: &str) -> Result<Step> {
        let mut stream = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(Step::Aborted),
            stream = self.client.synthesize(sentence) => stream?,
        };

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(Step::Aborted),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            self.report.audio_bytes += chunk.data.len();
            if let Some(unit) = self.batcher.push(chunk)? {
                if !self.deliver(unit) {
                    return Ok(Step::Aborted);
                }
            }
        }

        if let Some(unit) = self.batcher.finish()? {
            if !self.deliver(unit) {
                return Ok(Step::Aborted);
            }
        }

        tracing::trace!(request_id = ?stream.request_id(), "sentence delivered");
        Ok(Step::Done)
    }

    fn deliver(&mut self, unit: PlaybackUnit) -> bool {
        let delivered = self.gate.deliver(unit);
        if delivered {
            self.report.units_delivered += 1;
        }
        delivered
    }

    fn aborted(&mut self) -> SpeakReport {
        self.batcher.reset();
        self.report.aborted = true;
        std::mem::take(&mut self.report)
    }
}
