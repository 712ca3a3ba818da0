//! Audio chunk batching
//!
//! Synthesis backends stream small PCM chunks. Playing each one separately
//! produces audible seams, so chunks are grouped into playback units: the
//! first unit of a request goes out after a single chunk (fast first audio),
//! later units wait for `batch_size` chunks. Every unit is wrapped in a WAV
//! container so the playback side can decode it independently.

use std::io::Cursor;

use crate::config::BatcherConfig;
use crate::synthesis::AudioChunk;
use crate::voice::PlaybackUnit;
use crate::{Error, Result};

/// Groups raw synthesis chunks into playback units
#[derive(Debug)]
pub struct ChunkBatcher {
    batch_size: usize,
    sample_rate: u32,
    request_id: Option<String>,
    pending: Vec<u8>,
    pending_chunks: usize,
    emitted: u32,
}

impl ChunkBatcher {
    /// Create a batcher producing units at `sample_rate`
    #[must_use]
    pub fn new(config: &BatcherConfig, sample_rate: u32) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            sample_rate,
            request_id: None,
            pending: Vec::new(),
            pending_chunks: 0,
            emitted: 0,
        }
    }

    /// Add a chunk, returning a unit when a batch is full
    ///
    /// A chunk from a different request than the one in progress starts a
    /// new request; unflushed audio of the old one is discarded.
    ///
    /// # Errors
    ///
    /// Returns error if the audio container cannot be written
    pub fn push(&mut self, chunk: AudioChunk) -> Result<Option<PlaybackUnit>> {
        if self.request_id.as_deref() != Some(chunk.request_id.as_str()) {
            if !self.pending.is_empty() {
                tracing::warn!(
                    previous = ?self.request_id,
                    next = %chunk.request_id,
                    bytes = self.pending.len(),
                    "discarding unflushed audio from previous request"
                );
            }
            self.reset();
            self.request_id = Some(chunk.request_id);
        }

        self.pending.extend_from_slice(&chunk.data);
        self.pending_chunks += 1;

        let threshold = if self.emitted == 0 { 1 } else { self.batch_size };
        if self.pending_chunks >= threshold {
            return self.flush(false);
        }
        Ok(None)
    }

    /// Flush whatever is buffered for the current request
    ///
    /// # Errors
    ///
    /// Returns error if the audio container cannot be written
    pub fn finish(&mut self) -> Result<Option<PlaybackUnit>> {
        let unit = self.flush(true)?;
        self.request_id = None;
        self.emitted = 0;
        Ok(unit)
    }

    /// Drop all buffered audio (barge-in / abort)
    pub fn reset(&mut self) {
        self.request_id = None;
        self.pending.clear();
        self.pending_chunks = 0;
        self.emitted = 0;
    }

    /// Number of chunks waiting in the current batch
    #[must_use]
    pub const fn pending_chunks(&self) -> usize {
        self.pending_chunks
    }

    fn flush(&mut self, last: bool) -> Result<Option<PlaybackUnit>> {
        self.pending_chunks = 0;

        // keep units sample-aligned; an odd byte waits for the next chunk
        let carry = if self.pending.len() % 2 == 1 {
            self.pending.pop()
        } else {
            None
        };
        if last && carry.is_some() {
            tracing::debug!("dropping trailing half sample");
        }

        let pcm = std::mem::take(&mut self.pending);
        if let (false, Some(byte)) = (last, carry) {
            self.pending.push(byte);
        }

        if pcm.is_empty() {
            return Ok(None);
        }

        let sequence = self.emitted;
        self.emitted += 1;

        Ok(Some(PlaybackUnit {
            correlation_id: self.request_id.clone().unwrap_or_default(),
            sequence,
            audio: pcm16_to_wav(&pcm, self.sample_rate)?,
        }))
    }
}

/// Wrap little-endian 16-bit mono PCM in a WAV container
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
