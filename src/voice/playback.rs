//! Audio playback to speakers
//!
//! [`PlaybackQueue`] sequences decoded units onto a [`PlaybackSink`], one at
//! a time, starting the next unit only when the sink reports the current one
//! finished. Units whose rate differs from the output rate are resampled
//! with rubato before they reach the sink. [`CpalSink`] is the device
//! implementation; it owns the output streams on a dedicated playback thread
//! because cpal streams are not `Send`.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::watch;

use crate::{Error, Result};

/// A batched, self-describing audio buffer ready for output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackUnit {
    /// Request (or source) the audio belongs to
    pub correlation_id: String,
    /// Position of this unit within its request
    pub sequence: u32,
    /// Encoded audio (WAV, MP3, or raw 16-bit PCM)
    pub audio: Vec<u8>,
}

/// Callback a sink invokes once a source has played to the end
pub type CompletionFn = Box<dyn FnOnce() + Send>;

/// A source currently producing sound
pub trait ActiveSource: Send {
    /// Stop output immediately
    fn stop(&mut self);
}

/// Output device seam
pub trait PlaybackSink: Send + Sync {
    /// Start playing mono samples at `sample_rate`
    ///
    /// [`PlaybackQueue`] always passes its own output rate.
    ///
    /// `done` must be called exactly once when the samples have been played,
    /// and never from inside `play` itself. Stopped sources may skip it.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot start playback
    fn play(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        done: CompletionFn,
    ) -> Result<Box<dyn ActiveSource>>;
}

/// Something that accepts playback units from the synthesis side
pub trait UnitSink: Send + Sync {
    /// Hand over a unit; ordering across calls must be preserved
    fn deliver(&self, unit: PlaybackUnit);

    /// Drop everything delivered so far that has not played yet
    fn clear(&self);
}

/// Decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

struct QueueState {
    pending: VecDeque<PlaybackUnit>,
    active: Option<(u64, Box<dyn ActiveSource>)>,
    next_source_id: u64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    sink: Arc<dyn PlaybackSink>,
    output_rate: u32,
    idle: watch::Sender<bool>,
}

/// Ordered, cancellable playback queue
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<QueueInner>,
}

impl PlaybackQueue {
    /// Create a queue playing through `sink` at `output_rate`
    ///
    /// Raw PCM is assumed to be at `output_rate` already.
    #[must_use]
    pub fn new(sink: Arc<dyn PlaybackSink>, output_rate: u32) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    active: None,
                    next_source_id: 0,
                }),
                sink,
                output_rate,
                idle,
            }),
        }
    }

    /// Queue a unit; starts playback if nothing is playing
    pub fn enqueue(&self, unit: PlaybackUnit) {
        let mut state = self.lock();
        state.pending.push_back(unit);
        if state.active.is_none() {
            self.start_next(&mut state);
        } else {
            self.inner.idle.send_replace(false);
        }
    }

    /// Empty the queue and stop the active source (barge-in / abort)
    pub fn clear(&self) {
        let mut state = self.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        if let Some((id, mut source)) = state.active.take() {
            source.stop();
            tracing::debug!(source = id, dropped, "playback cleared");
        } else if dropped > 0 {
            tracing::debug!(dropped, "playback cleared");
        }
        self.inner.idle.send_replace(true);
    }

    /// Whether a unit is currently producing sound
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Whether the queue is drained and nothing is playing
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.active.is_none() && state.pending.is_empty()
    }

    /// Number of units waiting behind the active one
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Watch playback completion; the value is `true` while idle
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.idle.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_next(&self, state: &mut QueueState) {
        while let Some(unit) = state.pending.pop_front() {
            let output_rate = self.inner.output_rate;
            let Some(audio) = decode_unit(&unit.audio, output_rate) else {
                tracing::warn!(
                    correlation_id = %unit.correlation_id,
                    sequence = unit.sequence,
                    bytes = unit.audio.len(),
                    "skipping undecodable playback unit"
                );
                continue;
            };
            let samples = match resample(&audio.samples, audio.sample_rate, output_rate) {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        correlation_id = %unit.correlation_id,
                        unit_rate = audio.sample_rate,
                        "skipping unit that cannot be resampled"
                    );
                    continue;
                }
            };

            let id = state.next_source_id;
            state.next_source_id += 1;

            let queue = self.clone();
            let done: CompletionFn = Box::new(move || queue.on_source_finished(id));

            match self.inner.sink.play(samples, output_rate, done) {
                Ok(source) => {
                    tracing::trace!(
                        source = id,
                        correlation_id = %unit.correlation_id,
                        sequence = unit.sequence,
                        "playing unit"
                    );
                    state.active = Some((id, source));
                    self.inner.idle.send_replace(false);
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "playback failed, skipping unit");
                }
            }
        }

        self.inner.idle.send_replace(true);
    }

    fn on_source_finished(&self, id: u64) {
        let mut state = self.lock();
        // a cleared source may still report completion
        if !matches!(state.active, Some((active, _)) if active == id) {
            return;
        }
        state.active = None;
        self.start_next(&mut state);
    }
}

impl UnitSink for PlaybackQueue {
    fn deliver(&self, unit: PlaybackUnit) {
        self.enqueue(unit);
    }

    fn clear(&self) {
        Self::clear(self);
    }
}

/// Decode a unit: WAV, then MP3, then raw signed 16-bit PCM
///
/// Returns `None` when nothing playable can be recovered.
#[must_use]
pub fn decode_unit(data: &[u8], default_rate: u32) -> Option<DecodedAudio> {
    if data.starts_with(b"RIFF") {
        match decode_wav(data) {
            Ok(audio) => return Some(audio),
            Err(e) => tracing::debug!(error = %e, "wav decode failed, trying raw pcm"),
        }
    } else if looks_like_mp3(data) {
        match decode_mp3(data) {
            Ok(audio) if !audio.samples.is_empty() => return Some(audio),
            Ok(_) => tracing::debug!("mp3 stream had no frames, trying raw pcm"),
            Err(e) => tracing::debug!(error = %e, "mp3 decode failed, trying raw pcm"),
        }
    }

    decode_pcm16(data).map(|samples| DecodedAudio {
        samples,
        sample_rate: default_rate,
    })
}

fn looks_like_mp3(data: &[u8]) -> bool {
    data.starts_with(b"ID3") || (data.len() > 1 && data[0] == 0xFF && data[1] & 0xE0 == 0xE0)
}

fn decode_wav(data: &[u8]) -> Result<DecodedAudio> {
    let mut reader =
        hound::WavReader::new(Cursor::new(data)).map_err(|e| Error::Decode(e.to_string()))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(Error::Decode(format!(
            "unsupported wav format: {} bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let raw: Vec<i16> = reader
        .samples::<i16>()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Decode(e.to_string()))?;
    if raw.is_empty() {
        return Err(Error::Decode("empty wav payload".to_string()));
    }

    Ok(DecodedAudio {
        samples: downmix(&raw, usize::from(spec.channels)),
        sample_rate: spec.sample_rate,
    })
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                #[allow(clippy::cast_sign_loss)]
                {
                    sample_rate = frame.sample_rate as u32;
                }
                samples.extend(downmix(&frame.data, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Decode(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Resample mono audio from `from_rate` to `to_rate`, keeping its duration
///
/// The resampler's delay is trimmed from the front and the tail is flushed
/// with silence, so the output holds `len * to_rate / from_rate` samples
/// (rounded) aligned with the input.
///
/// # Errors
///
/// Returns error if either rate is zero or the resampler rejects them
#[allow(clippy::cast_possible_truncation)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    const CHUNK_SIZE: usize = 1024;

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(Error::Decode(format!(
            "cannot resample {from_rate} Hz to {to_rate} Hz"
        )));
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, 2, 1)
            .map_err(|e| Error::Decode(format!("resampler init failed: {e}")))?;

    let expected = ((samples.len() as u64 * u64::from(to_rate) + u64::from(from_rate) / 2)
        / u64::from(from_rate)) as usize;
    let delay = resampler.output_delay();
    let wanted = expected + delay;

    let chunk_len = resampler.input_frames_next();
    let mut output = Vec::with_capacity(wanted + resampler.output_frames_max());
    let mut chunk = vec![0.0f32; chunk_len];
    let mut position = 0;
    while output.len() < wanted {
        chunk.fill(0.0);
        if position < samples.len() {
            let end = (position + chunk_len).min(samples.len());
            chunk[..end - position].copy_from_slice(&samples[position..end]);
        }
        position += chunk_len;

        let frames = resampler
            .process(&[chunk.as_slice()], None)
            .map_err(|e| Error::Decode(format!("resample failed: {e}")))?;
        let Some(channel) = frames.first().filter(|c| !c.is_empty()) else {
            return Err(Error::Decode("resampler produced no output".to_string()));
        };
        output.extend_from_slice(channel);
    }

    output.truncate(wanted);
    Ok(output.split_off(delay))
}

fn decode_pcm16(data: &[u8]) -> Option<Vec<f32>> {
    if data.is_empty() || data.len() % 2 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
            .collect(),
    )
}

/// Convert interleaved i16 samples to mono f32 by averaging channels
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[i16], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.iter().map(|&s| f32::from(s) / 32768.0).collect();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| f32::from(s) / 32768.0).sum();
            sum / frame.len() as f32
        })
        .collect()
}

enum SinkCommand {
    Play {
        id: usize,
        samples: Vec<f32>,
        sample_rate: u32,
        done: CompletionFn,
    },
    Stop {
        id: usize,
    },
}

/// Plays audio on the default output device from a dedicated thread
pub struct CpalSink {
    commands: Mutex<std_mpsc::Sender<SinkCommand>>,
    next_id: AtomicUsize,
}

impl CpalSink {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(sample_rate: u32) -> Result<Self> {
        let (tx, rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        std::thread::Builder::new()
            .name("beacon-playback".to_string())
            .spawn(move || match open_output(sample_rate) {
                Ok((device, config)) => {
                    let _ = ready_tx.send(Ok(()));
                    run_playback_thread(&device, &config, &rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited".to_string()))??;

        Ok(Self {
            commands: Mutex::new(tx),
            next_id: AtomicUsize::new(0),
        })
    }

    fn send(&self, command: SinkCommand) -> Result<()> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(command)
            .map_err(|_| Error::Audio("playback thread exited".to_string()))
    }
}

impl PlaybackSink for CpalSink {
    fn play(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        done: CompletionFn,
    ) -> Result<Box<dyn ActiveSource>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(SinkCommand::Play {
            id,
            samples,
            sample_rate,
            done,
        })?;

        let commands = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(Box::new(CpalSource { id, commands }))
    }
}

struct CpalSource {
    id: usize,
    commands: std_mpsc::Sender<SinkCommand>,
}

impl ActiveSource for CpalSource {
    fn stop(&mut self) {
        let _ = self.commands.send(SinkCommand::Stop { id: self.id });
    }
}

fn open_output(sample_rate: u32) -> Result<(cpal::Device, StreamConfig)> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio playback initialized"
    );

    Ok((device, config))
}

struct Playing {
    id: usize,
    stream: cpal::Stream,
    finished: Arc<AtomicBool>,
    done: CompletionFn,
}

fn run_playback_thread(
    device: &cpal::Device,
    config: &StreamConfig,
    commands: &std_mpsc::Receiver<SinkCommand>,
) {
    let mut current: Option<Playing> = None;

    loop {
        match commands.recv_timeout(Duration::from_millis(10)) {
            Ok(SinkCommand::Play {
                id,
                samples,
                sample_rate,
                done,
            }) => {
                let samples = match resample(&samples, sample_rate, config.sample_rate.0) {
                    Ok(samples) => samples,
                    Err(e) => {
                        tracing::error!(error = %e, "cannot convert audio to device rate");
                        done();
                        continue;
                    }
                };
                match start_stream(device, config, samples) {
                    Ok((stream, finished)) => {
                        current = Some(Playing {
                            id,
                            stream,
                            finished,
                            done,
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to start output stream");
                        done();
                    }
                }
            }
            Ok(SinkCommand::Stop { id }) => {
                if current.as_ref().is_some_and(|p| p.id == id) {
                    current = None;
                    tracing::debug!(source = id, "output stopped");
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if current
            .as_ref()
            .is_some_and(|p| p.finished.load(Ordering::Acquire))
        {
            if let Some(playing) = current.take() {
                drop(playing.stream);
                (playing.done)();
            }
        }
    }
}

fn start_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    samples: Vec<f32>,
) -> Result<(cpal::Stream, Arc<AtomicBool>)> {
    let channels = usize::from(config.channels);
    let finished = Arc::new(AtomicBool::new(samples.is_empty()));
    let finished_clone = Arc::clone(&finished);
    let mut position = 0usize;

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    if position < samples.len() {
                        position += 1;
                    } else {
                        finished_clone.store(true, Ordering::Release);
                    }
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok((stream, finished))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::pcm16_to_wav;

    /// Sink that records what it was asked to play and lets the test finish sources
    #[derive(Default)]
    struct ManualSink {
        played: Mutex<Vec<Vec<f32>>>,
        pending: Mutex<Vec<CompletionFn>>,
        stopped: Arc<AtomicUsize>,
    }

    struct ManualSource {
        stopped: Arc<AtomicUsize>,
    }

    impl ActiveSource for ManualSource {
        fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PlaybackSink for ManualSink {
        fn play(
            &self,
            samples: Vec<f32>,
            _sample_rate: u32,
            done: CompletionFn,
        ) -> Result<Box<dyn ActiveSource>> {
            self.played.lock().unwrap().push(samples);
            self.pending.lock().unwrap().push(done);
            Ok(Box::new(ManualSource {
                stopped: Arc::clone(&self.stopped),
            }))
        }
    }

    impl ManualSink {
        fn finish_oldest(&self) {
            let done = self.pending.lock().unwrap().remove(0);
            done();
        }

        fn played_count(&self) -> usize {
            self.played.lock().unwrap().len()
        }
    }

    fn unit(seq: u32, pcm: &[u8]) -> PlaybackUnit {
        PlaybackUnit {
            correlation_id: "r".to_string(),
            sequence: seq,
            audio: pcm16_to_wav(pcm, 24_000).unwrap(),
        }
    }

    #[test]
    fn plays_units_one_at_a_time_in_order() {
        let sink = Arc::new(ManualSink::default());
        let queue = PlaybackQueue::new(sink.clone(), 24_000);

        queue.enqueue(unit(0, &[0, 64]));
        queue.enqueue(unit(1, &[0, 32]));
        assert_eq!(sink.played_count(), 1);
        assert_eq!(queue.pending_len(), 1);
        assert!(!queue.is_idle());

        sink.finish_oldest();
        assert_eq!(sink.played_count(), 2);
        let played = sink.played.lock().unwrap().clone();
        assert!(played[0][0] > played[1][0]);

        sink.finish_oldest();
        assert!(queue.is_idle());
        assert!(*queue.subscribe().borrow());
    }

    #[test]
    fn clear_stops_active_and_ignores_its_completion() {
        let sink = Arc::new(ManualSink::default());
        let queue = PlaybackQueue::new(sink.clone(), 24_000);

        for seq in 0..4 {
            queue.enqueue(unit(seq, &[1, 0]));
        }
        queue.clear();

        assert_eq!(sink.stopped.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());

        // stopped source reports completion late: nothing else may start
        sink.finish_oldest();
        assert_eq!(sink.played_count(), 1);
        assert!(!queue.is_playing());
    }

    #[test]
    fn undecodable_unit_is_skipped() {
        let sink = Arc::new(ManualSink::default());
        let queue = PlaybackQueue::new(sink.clone(), 24_000);

        queue.enqueue(PlaybackUnit {
            correlation_id: "bad".to_string(),
            sequence: 0,
            audio: vec![1, 2, 3],
        });
        assert_eq!(sink.played_count(), 0);
        assert!(queue.is_idle());

        queue.enqueue(unit(1, &[1, 0]));
        assert_eq!(sink.played_count(), 1);
    }

    #[test]
    fn raw_pcm_fallback() {
        let audio = decode_unit(&[0, 0, 0, 64], 24_000).expect("raw pcm");
        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.samples.len(), 2);
        assert!((audio.samples[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn corrupt_wav_falls_back_to_pcm() {
        // RIFF magic with a truncated header, even length
        let audio = decode_unit(b"RIFF\x00\x00", 16_000).expect("fallback");
        assert_eq!(audio.samples.len(), 3);
        assert_eq!(audio.sample_rate, 16_000);
    }

    #[test]
    fn empty_payload_is_undecodable() {
        assert!(decode_unit(&[], 24_000).is_none());
    }

    #[allow(clippy::cast_precision_loss)]
    fn tone(rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn resample_keeps_duration() {
        let input = tone(16_000, 1600);
        let output = resample(&input, 16_000, 24_000).unwrap();
        assert_eq!(output.len(), 2400);

        let mp3_rate = resample(&tone(22_050, 2205), 22_050, 24_000).unwrap();
        assert_eq!(mp3_rate.len(), 2400);
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn resample_preserves_level_and_alignment() {
        let input = tone(16_000, 3200);
        let output = resample(&input, 16_000, 24_000).unwrap();
        let expected = tone(24_000, 4800);

        // skip the edges where the filter sees padding
        let middle = 1000..3800;
        let error: f32 = output[middle.clone()]
            .iter()
            .zip(&expected[middle.clone()])
            .map(|(a, b)| (a - b).abs())
            .sum::<f32>()
            / middle.len() as f32;
        assert!(error < 0.1, "mean error {error}");
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let input = vec![0.1, -0.2, 0.3];
        assert_eq!(resample(&input, 24_000, 24_000).unwrap(), input);
        assert!(resample(&input, 0, 24_000).is_err());
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn queue_converts_units_to_output_rate() {
        let sink = Arc::new(ManualSink::default());
        let queue = PlaybackQueue::new(sink.clone(), 24_000);

        let pcm: Vec<u8> = tone(16_000, 800)
            .iter()
            .flat_map(|&s| ((s * 32767.0) as i16).to_le_bytes())
            .collect();
        queue.enqueue(PlaybackUnit {
            correlation_id: "slow".to_string(),
            sequence: 0,
            audio: pcm16_to_wav(&pcm, 16_000).unwrap(),
        });

        let played = sink.played.lock().unwrap().clone();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0].len(), 1200);
    }

    #[test]
    fn wav_keeps_its_own_rate() {
        let wav = pcm16_to_wav(&[0, 0, 0, 0], 16_000).unwrap();
        let audio = decode_unit(&wav, 24_000).unwrap();
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(audio.samples.len(), 2);
    }
}
