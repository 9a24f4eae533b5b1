//! Audio capture from microphone

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::{AudioFrame, duration_to_samples, samples_to_duration};
use crate::{Error, Result};

/// Frames buffered between the device callback and the segmenter (~5s at 20ms)
const FRAME_QUEUE: usize = 256;

/// A source of capture frames, held for the duration of one capture
///
/// Dropping the source releases the underlying device.
#[async_trait(?Send)]
pub trait FrameSource {
    /// Wait for the next frame; `None` once the source is exhausted
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>>;

    /// Release the device early; further reads return `None`
    fn close(&mut self) {}
}

#[async_trait(?Send)]
impl FrameSource for mpsc::Receiver<AudioFrame> {
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        Ok(self.recv().await)
    }

    fn close(&mut self) {
        Self::close(self);
    }
}

/// Something that can open a fresh capture per turn
pub trait AudioInput {
    /// Acquire the device and start producing frames
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` when the OS refuses microphone
    /// access and `Error::Capture` for any other device failure
    fn open(&mut self) -> Result<Box<dyn FrameSource>>;
}

/// The default input device, configured for mono capture at the session rate
pub struct Microphone {
    device: Device,
    config: StreamConfig,
    sample_rate: u32,
    frame_samples: usize,
}

impl Microphone {
    /// Find the default input device and a config matching `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no input device or suitable config is available
    pub fn new(sample_rate: u32, frame_samples: usize) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Capture("no input device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        };

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| classify_device_error(e.to_string()))?
            .find(|c| c.channels() == 1 && supports_rate(c))
            .or_else(|| {
                // Fallback: any channel layout, downmixed in the callback
                device
                    .supported_input_configs()
                    .ok()?
                    .find(|c| supports_rate(c))
            })
            .ok_or_else(|| {
                Error::Capture(format!("no input config supports {sample_rate} Hz"))
            })?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            frame_samples,
            "microphone initialized"
        );

        Ok(Self {
            device,
            config,
            sample_rate,
            frame_samples: frame_samples.max(1),
        })
    }

    /// Start capturing; the returned stream owns the device until dropped
    ///
    /// # Errors
    ///
    /// Returns error if the input stream cannot be built or started
    pub fn start(&self) -> Result<MicrophoneStream> {
        let (tx, rx) = mpsc::channel::<Result<AudioFrame>>(FRAME_QUEUE);
        let err_tx = tx.clone();

        let channels = usize::from(self.config.channels.max(1));
        let sample_rate = self.sample_rate;
        let frame_samples = self.frame_samples;

        let mut pending: Vec<f32> = Vec::with_capacity(frame_samples);
        let mut captured: usize = 0;
        let mut dropped: u64 = 0;

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for interleaved in data.chunks(channels) {
                        #[allow(clippy::cast_precision_loss)]
                        let mono = interleaved.iter().sum::<f32>() / interleaved.len() as f32;
                        pending.push(mono);

                        if pending.len() < frame_samples {
                            continue;
                        }

                        let timestamp = samples_to_duration(captured, sample_rate);
                        captured += frame_samples;
                        let samples =
                            std::mem::replace(&mut pending, Vec::with_capacity(frame_samples));

                        let frame = AudioFrame::new(samples, sample_rate, timestamp);
                        if tx.try_send(Ok(frame)).is_err() {
                            dropped += 1;
                            if dropped.is_power_of_two() {
                                tracing::warn!(dropped, "capture queue full, dropping frames");
                            }
                        }
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    let _ = err_tx.try_send(Err(Error::Capture(err.to_string())));
                },
                None,
            )
            .map_err(|e| classify_device_error(e.to_string()))?;

        stream
            .play()
            .map_err(|e| classify_device_error(e.to_string()))?;

        tracing::debug!("microphone capture started");

        Ok(MicrophoneStream {
            stream: Some(stream),
            frames: rx,
            continuity: Continuity::default(),
        })
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioInput for Microphone {
    fn open(&mut self) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(self.start()?))
    }
}

/// A running capture; the microphone is released when this is dropped
///
/// Frames dropped on a full queue leave a hole in the capture timeline.
/// The next frame after a hole is reported as `Error::Capture`, so an
/// utterance never spans missing audio.
pub struct MicrophoneStream {
    stream: Option<Stream>,
    frames: mpsc::Receiver<Result<AudioFrame>>,
    continuity: Continuity,
}

#[async_trait(?Send)]
impl FrameSource for MicrophoneStream {
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        if self.stream.is_none() {
            return Ok(None);
        }
        let Some(frame) = self.frames.recv().await.transpose()? else {
            return Ok(None);
        };
        self.continuity.check(&frame)?;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            self.frames.close();
            tracing::debug!("microphone released");
        }
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Tracks the sample position the next frame must start at
#[derive(Debug, Default)]
struct Continuity {
    next_sample: Option<u64>,
}

impl Continuity {
    fn check(&mut self, frame: &AudioFrame) -> Result<()> {
        let rate = frame.sample_rate();
        let start = duration_to_samples(frame.timestamp(), rate);
        let expected = self.next_sample.replace(start + frame.samples().len() as u64);

        match expected {
            Some(expected) if start > expected => {
                let missing = start - expected;
                tracing::warn!(missing, "capture frames dropped");
                #[allow(clippy::cast_possible_truncation)]
                let gap = samples_to_duration(missing as usize, rate);
                Err(Error::Capture(format!(
                    "capture fell behind, {} ms of audio dropped",
                    gap.as_millis()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Map a backend error to `PermissionDenied` when it reads like an access refusal
///
/// cpal surfaces OS permission failures as backend-specific strings, so the
/// only signal available is the message text.
fn classify_device_error(message: String) -> Error {
    if is_permission_denial(&message) {
        Error::PermissionDenied(message)
    } else {
        Error::Capture(message)
    }
}

fn is_permission_denial(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("permission")
        || lower.contains("access denied")
        || lower.contains("not authorized")
        || lower.contains("not permitted")
        || lower.contains("eacces")
}
