//! Shared test utilities
//!
//! In-memory microphones, scripted transports and signal generators, so the
//! pipeline can be driven without audio hardware or a remote agent.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use voxturn::audio::{AudioFrame, AudioInput, FrameSource, SAMPLE_RATE};
use voxturn::conversation::StateObserver;
use voxturn::segmenter::Utterance;
use voxturn::transport::{
    RawReply, RawReplyReceiver, ReplyTransport, Strategy, reply_channel,
};
use voxturn::{Error, Result, SessionState};

/// Capture window used by the generators
pub const FRAME_MS: u64 = 20;

/// Samples per capture window
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize * FRAME_MS as usize) / 1000;

/// Generate sine wave audio samples
pub fn generate_sine_samples(frequency: f32, count: usize, amplitude: f32) -> Vec<f32> {
    (0..count)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// One capture frame at `at_ms`: a 440Hz tone, or near-silence when `loud` is false
pub fn frame(at_ms: u64, loud: bool) -> AudioFrame {
    let samples = if loud {
        generate_sine_samples(440.0, FRAME_SAMPLES, 0.3)
    } else {
        vec![0.001; FRAME_SAMPLES]
    };
    AudioFrame::new(samples, SAMPLE_RATE, Duration::from_millis(at_ms))
}

/// Contiguous frames up to `total_ms`, speech inside `[loud_from, loud_to)`
pub fn speech_trace(total_ms: u64, loud_from: u64, loud_to: u64) -> Vec<AudioFrame> {
    (0..total_ms / FRAME_MS)
        .map(|i| {
            let at = i * FRAME_MS;
            frame(at, at >= loud_from && at < loud_to)
        })
        .collect()
}

/// A short utterance for transport tests
pub fn utterance(ms: u64) -> Utterance {
    let frames = (0..ms / FRAME_MS).map(|i| frame(i * FRAME_MS, true)).collect();
    Utterance::from_frames(frames).expect("non-empty utterance")
}

/// Frame source over a fixed list, counting reads and closes
pub struct VecSource {
    frames: VecDeque<AudioFrame>,
    served: Rc<Cell<usize>>,
    closed: Rc<Cell<usize>>,
}

impl VecSource {
    pub fn new(frames: Vec<AudioFrame>) -> Self {
        Self {
            frames: frames.into(),
            served: Rc::new(Cell::new(0)),
            closed: Rc::new(Cell::new(0)),
        }
    }

    pub fn served(&self) -> usize {
        self.served.get()
    }

    pub fn closed(&self) -> usize {
        self.closed.get()
    }
}

#[async_trait(?Send)]
impl FrameSource for VecSource {
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.served.set(self.served.get() + 1);
        }
        Ok(frame)
    }

    fn close(&mut self) {
        self.closed.set(self.closed.get() + 1);
    }
}

/// What the microphone delivers on one turn
pub enum Capture {
    Frames(Vec<AudioFrame>),
    Fail(Error),
}

/// Microphone that plays back one scripted capture per turn
///
/// Once the script runs out every capture is empty, which ends the session
/// with no speech.
#[derive(Default)]
pub struct ScriptedInput {
    turns: VecDeque<Capture>,
    pub opened: Rc<Cell<usize>>,
    pub closed: Rc<Cell<usize>>,
    /// Clock reading at every successful open
    pub opened_at: Rc<RefCell<Vec<Instant>>>,
}

impl ScriptedInput {
    pub fn new(turns: Vec<Capture>) -> Self {
        Self {
            turns: turns.into(),
            ..Self::default()
        }
    }

    /// Every turn speaks for 1.6s starting at 200ms
    pub fn speaking(turns: usize) -> Self {
        Self::new(
            (0..turns)
                .map(|_| Capture::Frames(speech_trace(3000, 200, 1800)))
                .collect(),
        )
    }
}

impl AudioInput for ScriptedInput {
    fn open(&mut self) -> Result<Box<dyn FrameSource>> {
        let frames = match self.turns.pop_front() {
            Some(Capture::Frames(frames)) => frames,
            Some(Capture::Fail(err)) => return Err(err),
            None => Vec::new(),
        };
        self.opened.set(self.opened.get() + 1);
        self.opened_at.borrow_mut().push(Instant::now());

        let source = VecSource {
            frames: frames.into(),
            served: Rc::new(Cell::new(0)),
            closed: Rc::clone(&self.closed),
        };
        Ok(Box::new(source))
    }
}

/// One step of a scripted reply
#[derive(Clone)]
pub enum Step {
    Reply(RawReply),
    Delay(Duration),
    Fail(String),
}

/// What a scripted transport does on one turn
#[derive(Clone)]
pub enum TurnScript {
    FailOpen,
    Steps(Vec<Step>),
}

/// Transport replaying one script per `open`
pub struct ScriptedTransport {
    strategy: Strategy,
    turns: VecDeque<TurnScript>,
    opens: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(strategy: Strategy, turns: Vec<TurnScript>) -> Self {
        Self {
            strategy,
            turns: turns.into(),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of `open` calls, readable after the transport is boxed
    pub fn opens(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }
}

#[async_trait]
impl ReplyTransport for ScriptedTransport {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    async fn open(&mut self, _utterance: Arc<Utterance>) -> Result<RawReplyReceiver> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let steps = match self.turns.pop_front() {
            Some(TurnScript::Steps(steps)) => steps,
            Some(TurnScript::FailOpen) | None => {
                return Err(Error::Transport("connection refused".to_string()));
            }
        };

        let (tx, rx) = reply_channel();
        tokio::spawn(async move {
            for step in steps {
                let reply = match step {
                    Step::Delay(delay) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    Step::Reply(reply) => Ok(reply),
                    Step::Fail(message) => Err(Error::Transport(message)),
                };
                if tx.send(reply).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// A reply chunk of `ms` milliseconds at the session rate
pub fn audio_reply(ms: u64) -> RawReply {
    RawReply::Audio {
        samples: generate_sine_samples(220.0, (SAMPLE_RATE as usize * ms as usize) / 1000, 0.2),
        sample_rate: SAMPLE_RATE,
    }
}

/// Started, `chunks` chunks of 100ms, done
pub fn full_reply(chunks: usize) -> TurnScript {
    let mut steps = vec![Step::Reply(RawReply::Started)];
    steps.extend((0..chunks).map(|_| Step::Reply(audio_reply(100))));
    steps.push(Step::Reply(RawReply::Done));
    TurnScript::Steps(steps)
}

/// Observer recording every state and error cause
pub fn recorder() -> (
    impl StateObserver + 'static,
    Rc<RefCell<Vec<(SessionState, Option<String>)>>>,
) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let observer = move |state: SessionState, cause: Option<&str>| {
        sink.borrow_mut().push((state, cause.map(String::from)));
    };
    (observer, seen)
}

/// Just the states from a recording
pub fn states(seen: &Rc<RefCell<Vec<(SessionState, Option<String>)>>>) -> Vec<SessionState> {
    seen.borrow().iter().map(|(state, _)| *state).collect()
}
