//! Audio output clock and devices
//!
//! An output device exposes a monotonically advancing clock and accepts
//! sample buffers scheduled at absolute positions on that clock. Each
//! scheduled buffer yields a completion signal once its last sample has
//! been played.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tokio::sync::oneshot;

use super::{duration_to_samples, samples_to_duration};
use crate::{Error, Result};

/// An output timeline that buffers can be scheduled onto
pub trait OutputDevice {
    /// Rate the device renders at; scheduled buffers must match it
    fn sample_rate(&self) -> u32;

    /// Current position of the output clock
    fn now(&self) -> Duration;

    /// Schedule `samples` to start exactly at `at` on the output clock
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the device has failed
    fn schedule(&mut self, samples: Vec<f32>, at: Duration) -> Result<oneshot::Receiver<()>>;
}

struct Scheduled {
    start: u64,
    samples: Vec<f32>,
    done: Option<oneshot::Sender<()>>,
}

impl Scheduled {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Timeline {
    /// Samples rendered since the stream started
    position: u64,
    queue: VecDeque<Scheduled>,
    failure: Option<String>,
}

impl Timeline {
    fn sample_at_cursor(&self) -> f32 {
        let pos = self.position;
        self.queue
            .iter()
            .filter(|s| s.start <= pos && pos < s.end())
            .filter_map(|s| {
                usize::try_from(pos - s.start)
                    .ok()
                    .and_then(|offset| s.samples.get(offset))
            })
            .sum()
    }

    fn retire_finished(&mut self) {
        while let Some(front) = self.queue.front() {
            if front.end() > self.position {
                break;
            }
            if let Some(mut finished) = self.queue.pop_front() {
                if let Some(done) = finished.done.take() {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Mark the stream dead and drop every pending completion
    ///
    /// Waiters see their receiver close instead of hanging on a stream
    /// that will never render again.
    fn fail(&mut self, message: String) {
        self.failure = Some(message);
        self.queue.clear();
    }
}

/// Plays scheduled buffers on the default output device
pub struct CpalOutput {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    _stream: Stream,
}

impl CpalOutput {
    /// Open the default output device at `sample_rate` and start its clock
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Playback(e.to_string()))?
            .find(|c| c.channels() == 1 && supports_rate(c))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| c.channels() == 2 && supports_rate(c))
            })
            .ok_or_else(|| Error::Playback("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();
        let channels = usize::from(config.channels.max(1));

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio output initialized"
        );

        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let render_timeline = Arc::clone(&timeline);
        let error_timeline = Arc::clone(&timeline);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut timeline) = render_timeline.lock() else {
                        data.fill(0.0);
                        return;
                    };

                    for frame in data.chunks_mut(channels) {
                        let sample = timeline.sample_at_cursor();
                        frame.fill(sample);
                        timeline.position += 1;
                    }

                    timeline.retire_finished();
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    if let Ok(mut timeline) = error_timeline.lock() {
                        timeline.fail(err.to_string());
                    }
                },
                None,
            )
            .map_err(|e| Error::Playback(e.to_string()))?;

        stream.play().map_err(|e| Error::Playback(e.to_string()))?;

        Ok(Self {
            timeline,
            sample_rate,
            _stream: stream,
        })
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        let position = self.timeline.lock().map_or(0, |t| t.position);
        samples_to_duration(usize::try_from(position).unwrap_or(usize::MAX), self.sample_rate)
    }

    fn schedule(&mut self, samples: Vec<f32>, at: Duration) -> Result<oneshot::Receiver<()>> {
        let (done, completion) = oneshot::channel();
        let start = duration_to_samples(at, self.sample_rate);

        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| Error::Playback("output timeline poisoned".to_string()))?;

        if let Some(failure) = &timeline.failure {
            return Err(Error::Playback(failure.clone()));
        }

        timeline.queue.push_back(Scheduled {
            start,
            samples,
            done: Some(done),
        });
        drop(timeline);

        Ok(completion)
    }
}

/// An output that keeps time on the tokio clock without rendering anything
///
/// Used for muted sessions and for exercising the scheduler without audio
/// hardware. Completions fire when the tokio clock passes each buffer's end.
pub struct SilentOutput {
    sample_rate: u32,
    origin: tokio::time::Instant,
}

impl SilentOutput {
    /// Start a silent clock at the current tokio instant
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl OutputDevice for SilentOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule(&mut self, samples: Vec<f32>, at: Duration) -> Result<oneshot::Receiver<()>> {
        let (done, completion) = oneshot::channel();
        let deadline = self.origin + at + samples_to_duration(samples.len(), self.sample_rate);

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = done.send(());
        });

        Ok(completion)
    }
}
