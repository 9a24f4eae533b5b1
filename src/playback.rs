//! Jitter-buffered playback scheduling
//!
//! Reply frames are laid end to end on the output clock behind a single
//! play-head. A frame that arrives after the play-head has already passed
//! is moved forward to `now + lead_in` instead of overlapping or reordering,
//! leaving one short gap.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::audio::OutputDevice;
use crate::transport::ReplyFrame;
use crate::{Error, Result};

/// Where one frame landed on the output clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackWindow {
    pub seq: u64,
    pub start: Duration,
    pub end: Duration,
}

/// Schedules reply frames on an output device and tracks their completion
pub struct PlaybackScheduler {
    output: Box<dyn OutputDevice>,
    lead_in: Duration,
    /// Next free slot on the output clock; never moves backwards
    play_head: Duration,
    /// Whether the current turn has scheduled anything yet
    primed: bool,
    prebuffer: Option<Duration>,
    pending: Vec<ReplyFrame>,
    buffered: Duration,
    outstanding: Vec<oneshot::Receiver<()>>,
    windows: Vec<PlaybackWindow>,
    underruns: u64,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(output: Box<dyn OutputDevice>, lead_in: Duration) -> Self {
        Self {
            output,
            lead_in,
            play_head: Duration::ZERO,
            primed: false,
            prebuffer: None,
            pending: Vec::new(),
            buffered: Duration::ZERO,
            outstanding: Vec::new(),
            windows: Vec::new(),
            underruns: 0,
        }
    }

    /// Output device sample rate
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.output.sample_rate()
    }

    /// Reset per-turn state
    ///
    /// With `prebuffer` set, frames are held back until that much audio has
    /// arrived or [`finish`](Self::finish) is called.
    pub fn begin_turn(&mut self, prebuffer: Option<Duration>) {
        self.primed = false;
        self.prebuffer = prebuffer;
        self.pending.clear();
        self.buffered = Duration::ZERO;
        self.windows.clear();
    }

    /// Queue a reply frame for gapless playback
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the frame's rate differs from the output
    /// rate, or `Error::Playback` if the device refuses the buffer
    pub fn submit(&mut self, frame: ReplyFrame) -> Result<()> {
        let rate = self.output.sample_rate();
        if frame.sample_rate != rate {
            return Err(Error::Protocol(format!(
                "reply frame {} is {} Hz, output runs at {rate} Hz",
                frame.seq, frame.sample_rate
            )));
        }

        if let Some(threshold) = self.prebuffer {
            self.buffered += frame.duration();
            self.pending.push(frame);
            if self.buffered >= threshold {
                tracing::debug!(
                    buffered_ms = self.buffered.as_millis(),
                    frames = self.pending.len(),
                    "pre-buffer filled"
                );
                self.release_backlog()?;
            }
            return Ok(());
        }

        self.schedule(frame)
    }

    /// Mark the end of the reply stream, scheduling anything still held back
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the device refuses a buffer
    pub fn finish(&mut self) -> Result<()> {
        if self.prebuffer.is_some() {
            self.release_backlog()?;
        }
        Ok(())
    }

    /// Drop frames that were held back but never scheduled
    pub fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(frames = self.pending.len(), "discarding pre-buffered frames");
        }
        self.pending.clear();
        self.buffered = Duration::ZERO;
    }

    /// Wait until every scheduled frame has finished playing
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the device dropped a completion signal
    pub async fn drain(&mut self) -> Result<()> {
        let outstanding = std::mem::take(&mut self.outstanding);
        let count = outstanding.len();
        let mut result = Ok(());

        for completion in outstanding {
            if completion.await.is_err() && result.is_ok() {
                result = Err(Error::Playback(
                    "output device stopped before playback finished".to_string(),
                ));
            }
        }

        tracing::debug!(frames = count, "playback drained");
        result
    }

    /// Windows scheduled this turn, in submission order
    #[must_use]
    pub fn windows(&self) -> &[PlaybackWindow] {
        &self.windows
    }

    /// Times the play-head had to snap forward because replies arrived late
    #[must_use]
    pub const fn underruns(&self) -> u64 {
        self.underruns
    }

    #[must_use]
    pub const fn play_head(&self) -> Duration {
        self.play_head
    }

    /// Frames scheduled but not yet drained
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Schedule the held-back frames contiguously from `now + lead_in`
    fn release_backlog(&mut self) -> Result<()> {
        self.prebuffer = None;
        self.buffered = Duration::ZERO;

        let start = self.play_head.max(self.output.now() + self.lead_in);
        self.play_head = start;
        self.primed = true;

        for frame in std::mem::take(&mut self.pending) {
            self.place(frame, start)?;
        }
        Ok(())
    }

    fn schedule(&mut self, frame: ReplyFrame) -> Result<()> {
        let now = self.output.now();

        let start = if !self.primed {
            self.primed = true;
            self.play_head.max(now + self.lead_in)
        } else if self.play_head < now {
            self.underruns += 1;
            tracing::debug!(
                seq = frame.seq,
                late_ms = (now - self.play_head).as_millis(),
                "playback starved, snapping play-head"
            );
            now + self.lead_in
        } else {
            self.play_head
        };

        self.place(frame, start)
    }

    fn place(&mut self, frame: ReplyFrame, at: Duration) -> Result<()> {
        let start = at.max(self.play_head);
        let end = start + frame.duration();

        let completion = self.output.schedule(frame.samples, start)?;
        self.outstanding.push(completion);
        self.windows.push(PlaybackWindow {
            seq: frame.seq,
            start,
            end,
        });
        self.play_head = end;
        Ok(())
    }
}
