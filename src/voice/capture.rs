//! Audio capture from microphone
//!
//! The cpal input callback slices the device stream into fixed-size frames
//! and hands each one to a frame handler on the capture thread. Handlers
//! must not block.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use crate::config::CAPTURE_SAMPLE_RATE;
use crate::{Error, Result};

/// Captures audio from the default input device
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    frame_size: usize,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Create a new audio capture instance delivering `frame_size` samples per frame
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(frame_size: usize) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(CAPTURE_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(CAPTURE_SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = CAPTURE_SAMPLE_RATE,
            channels = config.channels,
            frame_size,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            frame_size: frame_size.max(1),
            stream: None,
        })
    }

    /// Start capturing, calling `on_frame` once per complete frame
    ///
    /// # Errors
    ///
    /// Returns error if capture fails
    pub fn start<F>(&mut self, mut on_frame: F) -> Result<()>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        if self.stream.is_some() {
            return Ok(());
        }

        let frame_size = self.frame_size;
        let mut pending: Vec<f32> = Vec::with_capacity(frame_size);

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mut rest = data;
                    while !rest.is_empty() {
                        let take = (frame_size - pending.len()).min(rest.len());
                        pending.extend_from_slice(&rest[..take]);
                        rest = &rest[take..];

                        if pending.len() == frame_size {
                            on_frame(&pending);
                            pending.clear();
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        CAPTURE_SAMPLE_RATE
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
