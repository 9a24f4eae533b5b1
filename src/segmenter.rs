//! Utterance segmentation (energy-based voice activity detection)
//!
//! A [`Segmenter`] is fed capture frames one at a time and decides where a
//! single utterance starts and ends. It never touches the device itself;
//! [`capture_utterance`] drives it from a [`FrameSource`] and guarantees the
//! source is closed on every exit path.

use std::time::Duration;

use crate::audio::{self, AudioFrame, FrameSource, energy};
use crate::config::VadConfig;
use crate::conversation::StopHandle;
use crate::{Error, Result};

/// Multiple of the ambient noise floor that counts as speech
const NOISE_FLOOR_FACTOR: f32 = 3.0;

/// Segmenter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// Estimating the ambient noise floor
    Warmup,
    /// Listening for the start of speech
    Waiting,
    /// Buffering an utterance
    Speaking,
    /// An utterance was emitted
    Finalized,
    /// Nobody spoke before the no-input timeout
    TimedOut,
}

impl SegmenterState {
    /// Whether the segmenter will accept no further frames
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::TimedOut)
    }
}

/// Outcome of feeding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum SegmenterEvent {
    /// Nothing decided yet
    Continue,
    /// This frame opened an utterance
    SpeechStarted,
    /// The utterance is complete
    Finalized(Utterance),
    /// Input timed out without any speech
    NoInput,
}

/// One complete user speech segment
///
/// Frames are contiguous and ordered; the utterance is immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    frames: Vec<AudioFrame>,
    sample_rate: u32,
}

impl Utterance {
    /// Build an utterance from contiguous capture frames
    ///
    /// Returns `None` for an empty frame list.
    #[must_use]
    pub fn from_frames(frames: Vec<AudioFrame>) -> Option<Self> {
        let sample_rate = frames.first()?.sample_rate();
        Some(Self {
            frames,
            sample_rate,
        })
    }

    #[must_use]
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Capture timestamp of the first sample
    #[must_use]
    pub fn start(&self) -> Duration {
        self.frames.first().map_or(Duration::ZERO, AudioFrame::timestamp)
    }

    /// Capture timestamp just past the last sample
    #[must_use]
    pub fn end(&self) -> Duration {
        self.frames.last().map_or(Duration::ZERO, AudioFrame::end)
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        audio::samples_to_duration(self.sample_count(), self.sample_rate)
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(|f| f.samples().len()).sum()
    }

    /// All samples concatenated in capture order
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        let mut samples = Vec::with_capacity(self.sample_count());
        for frame in &self.frames {
            samples.extend_from_slice(frame.samples());
        }
        samples
    }

    /// Encode as a 16-bit mono WAV file
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        audio::samples_to_wav(&self.samples(), self.sample_rate)
    }
}

/// Energy-threshold utterance detector
///
/// Times are measured from the first frame pushed. The noise floor is the
/// mean loudness of every frame starting inside the warmup window, whether
/// or not speech was detected there. During warmup the static threshold
/// alone gates speech; afterwards the effective threshold is
/// `max(static, 3 * noise_floor)`. The threshold in force when speech starts
/// is kept for the rest of the utterance.
#[derive(Debug)]
pub struct Segmenter {
    config: VadConfig,
    state: SegmenterState,
    origin: Option<Duration>,
    warmup_sum: f64,
    warmup_frames: u32,
    speech_threshold: f32,
    speech_start: Duration,
    last_speech_end: Duration,
    frames: Vec<AudioFrame>,
}

impl Segmenter {
    #[must_use]
    pub const fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: SegmenterState::Warmup,
            origin: None,
            warmup_sum: 0.0,
            warmup_frames: 0,
            speech_threshold: config.energy_threshold,
            speech_start: Duration::ZERO,
            last_speech_end: Duration::ZERO,
            frames: Vec::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SegmenterState {
        self.state
    }

    /// Mean loudness over the warmup window seen so far
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn noise_floor(&self) -> f32 {
        if self.warmup_frames == 0 {
            0.0
        } else {
            (self.warmup_sum / f64::from(self.warmup_frames)) as f32
        }
    }

    /// Threshold a frame must reach to count as speech right now
    #[must_use]
    pub fn effective_threshold(&self) -> f32 {
        match self.state {
            SegmenterState::Warmup => self.config.energy_threshold,
            SegmenterState::Speaking => self.speech_threshold,
            _ => self
                .config
                .energy_threshold
                .max(NOISE_FLOOR_FACTOR * self.noise_floor()),
        }
    }

    /// Feed the next capture frame
    pub fn push(&mut self, frame: AudioFrame) -> SegmenterEvent {
        if self.state.is_terminal() {
            return SegmenterEvent::Continue;
        }

        let origin = *self.origin.get_or_insert(frame.timestamp());
        let start = frame.timestamp().saturating_sub(origin);
        let end = start + frame.duration();
        let level = energy::loudness(&frame);

        let warmup = Duration::from_millis(self.config.warmup_ms);
        if start < warmup {
            self.warmup_sum += f64::from(level);
            self.warmup_frames += 1;
        } else if self.state == SegmenterState::Warmup {
            self.state = SegmenterState::Waiting;
            tracing::debug!(noise_floor = self.noise_floor(), "warmup complete");
        }

        match self.state {
            SegmenterState::Warmup | SegmenterState::Waiting => {
                let threshold = self.effective_threshold();
                if level >= threshold {
                    self.state = SegmenterState::Speaking;
                    self.speech_threshold = threshold;
                    self.speech_start = start;
                    self.last_speech_end = end;
                    self.frames.push(frame);
                    tracing::debug!(
                        at_ms = start.as_millis(),
                        level,
                        threshold,
                        "speech started"
                    );
                    SegmenterEvent::SpeechStarted
                } else if end >= Duration::from_millis(self.config.no_input_timeout_ms) {
                    self.state = SegmenterState::TimedOut;
                    tracing::debug!(at_ms = end.as_millis(), "no speech before timeout");
                    SegmenterEvent::NoInput
                } else {
                    SegmenterEvent::Continue
                }
            }
            SegmenterState::Speaking => {
                if level >= self.speech_threshold {
                    self.last_speech_end = end;
                }
                self.frames.push(frame);

                let silence = end.saturating_sub(self.last_speech_end);
                let timed_out = end >= Duration::from_millis(self.config.max_duration_ms);
                if silence >= Duration::from_millis(self.config.silence_after_speech_ms)
                    || timed_out
                {
                    tracing::debug!(
                        at_ms = end.as_millis(),
                        silence_ms = silence.as_millis(),
                        max_duration = timed_out,
                        "utterance finalized"
                    );
                    self.finalize()
                        .map_or(SegmenterEvent::Continue, SegmenterEvent::Finalized)
                } else {
                    SegmenterEvent::Continue
                }
            }
            SegmenterState::Finalized | SegmenterState::TimedOut => SegmenterEvent::Continue,
        }
    }

    /// End of input: emit whatever utterance is in progress
    pub fn flush(&mut self) -> Option<Utterance> {
        if self.state == SegmenterState::Speaking {
            self.finalize()
        } else {
            None
        }
    }

    /// Close the utterance at the end of the last speech frame
    fn finalize(&mut self) -> Option<Utterance> {
        self.state = SegmenterState::Finalized;

        let origin = self.origin.unwrap_or_default();
        let speech_end = self.last_speech_end;
        let mut frames = std::mem::take(&mut self.frames);
        frames.retain(|f| f.timestamp().saturating_sub(origin) < speech_end);

        Utterance::from_frames(frames)
    }
}

/// Capture a single utterance from `source`
///
/// Returns `Ok(None)` when nobody spoke before the no-input timeout, or the
/// source ran dry without any speech. The source is closed before returning
/// on every path.
///
/// # Errors
///
/// Returns `Error::Cancelled` if `stop` is raised mid-capture, or the
/// source's own error if capture fails
pub async fn capture_utterance(
    source: &mut dyn FrameSource,
    config: &VadConfig,
    stop: &StopHandle,
) -> Result<Option<Utterance>> {
    let mut segmenter = Segmenter::new(*config);
    let result = segment(&mut segmenter, source, stop).await;
    source.close();
    result
}

async fn segment(
    segmenter: &mut Segmenter,
    source: &mut dyn FrameSource,
    stop: &StopHandle,
) -> Result<Option<Utterance>> {
    loop {
        if stop.is_stopped() {
            return Err(Error::Cancelled);
        }

        let Some(frame) = source.next_frame().await? else {
            return Ok(segmenter.flush());
        };

        match segmenter.push(frame) {
            SegmenterEvent::Finalized(utterance) => return Ok(Some(utterance)),
            SegmenterEvent::NoInput => return Ok(None),
            SegmenterEvent::Continue | SegmenterEvent::SpeechStarted => {}
        }
    }
}
