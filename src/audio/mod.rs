//! Audio primitives
//!
//! Capture frames, loudness estimation, the output clock and WAV export.

mod capture;
pub mod energy;
mod output;
mod wav;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use capture::{AudioInput, FrameSource, Microphone, MicrophoneStream};
pub use output::{CpalOutput, OutputDevice, SilentOutput};
pub use wav::samples_to_wav;

/// Default session sample rate (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Convert a sample count to a duration without float rounding
#[must_use]
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = (samples as u128 * 1_000_000_000) / u128::from(sample_rate);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Convert a duration to a sample count, rounding to the nearest sample
#[must_use]
pub fn duration_to_samples(duration: Duration, sample_rate: u32) -> u64 {
    let scaled = duration.as_nanos() * u128::from(sample_rate) + 500_000_000;
    u64::try_from(scaled / 1_000_000_000).unwrap_or(u64::MAX)
}

/// A fixed-size window of mono samples captured from the microphone
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
    timestamp: Duration,
}

impl AudioFrame {
    /// Create a frame starting at `timestamp` (monotonic, relative to capture start)
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32, timestamp: Duration) -> Self {
        Self {
            samples,
            sample_rate,
            timestamp,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Capture time of the first sample
    #[must_use]
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }

    /// Capture time just past the last sample
    #[must_use]
    pub fn end(&self) -> Duration {
        self.timestamp + self.duration()
    }
}

/// PCM representation used on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    /// Little-endian 32-bit float
    #[default]
    F32,
    /// Little-endian 16-bit signed integer, rescaled by 1/32768
    I16,
}

impl SampleEncoding {
    /// Bytes per encoded sample
    #[must_use]
    pub const fn sample_width(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::I16 => 2,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::I16 => "i16",
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "f32" | "float32" | "float" => Ok(Self::F32),
            "i16" | "int16" | "s16" | "pcm16" => Ok(Self::I16),
            other => Err(Error::Config(format!("unknown sample encoding: {other}"))),
        }
    }
}
