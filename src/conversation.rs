//! Conversation loop - turns capture, transport and playback into a session
//!
//! Each turn listens for one utterance, sends it, streams the reply into the
//! playback scheduler and waits for playback to drain before listening
//! again. The loop owns the only [`SessionState`] an observer ever sees.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::audio::{AudioInput, OutputDevice};
use crate::config::{Config, PlaybackConfig, VadConfig};
use crate::error::TurnPolicy;
use crate::playback::PlaybackScheduler;
use crate::segmenter::{Utterance, capture_utterance};
use crate::transport::{ReplyEvent, ReplyStream, Strategy, TransportAdapter};
use crate::{Error, Result};

/// Turn-scoped failures tolerated in a row before the session gives up
const MAX_FAILED_TURNS: u32 = 3;

/// State exposed to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Sending,
    Streaming,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Receives every state transition, with a cause for `Error`
pub trait StateObserver {
    fn on_state(&self, state: SessionState, cause: Option<&str>);
}

impl<F> StateObserver for F
where
    F: Fn(SessionState, Option<&str>),
{
    fn on_state(&self, state: SessionState, cause: Option<&str>) {
        self(state, cause);
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

/// Shared stop request
///
/// Checked between turns and between capture frames. A reply arriving over
/// the media channel is interrupted as soon as stop is requested; other
/// replies are played out first.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<StopSignal>);

impl StopHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.requested.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    /// Resolves once stop has been requested
    pub async fn stopped(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Why a session ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Nobody spoke before the no-input timeout
    NoSpeech,
    /// Stop was requested
    Stopped,
}

/// What happened over a whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub turns: u32,
    pub end: EndReason,
    pub underruns: u64,
}

/// Explicit per-session state, owned by the loop
struct Session {
    id: Uuid,
    state: SessionState,
    observer: Box<dyn StateObserver>,
}

impl Session {
    fn set(&mut self, state: SessionState, cause: Option<&str>) {
        tracing::debug!(session = %self.id, from = %self.state, to = %state, cause, "state");
        self.state = state;
        self.observer.on_state(state, cause);
    }
}

enum TurnOutcome {
    Completed,
    NoSpeech,
}

/// Runs turns until nobody speaks, stop is requested, or a fatal error
pub struct ConversationLoop {
    session: Session,
    input: Box<dyn AudioInput>,
    transport: TransportAdapter,
    scheduler: PlaybackScheduler,
    vad: VadConfig,
    playback: PlaybackConfig,
    stop: StopHandle,
    utterance_dir: Option<PathBuf>,
}

impl ConversationLoop {
    /// Assemble a session
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the output device does not run at the
    /// session sample rate
    pub fn new(
        config: &Config,
        input: Box<dyn AudioInput>,
        transport: TransportAdapter,
        output: Box<dyn OutputDevice>,
        observer: impl StateObserver + 'static,
        stop: StopHandle,
    ) -> Result<Self> {
        if output.sample_rate() != config.audio.sample_rate {
            return Err(Error::Config(format!(
                "output runs at {} Hz, session at {} Hz",
                output.sample_rate(),
                config.audio.sample_rate
            )));
        }

        Ok(Self {
            session: Session {
                id: Uuid::new_v4(),
                state: SessionState::Idle,
                observer: Box::new(observer),
            },
            input,
            transport,
            scheduler: PlaybackScheduler::new(output, config.playback.lead_in()),
            vad: config.vad,
            playback: config.playback,
            stop,
            utterance_dir: None,
        })
    }

    /// Write each captured utterance as a WAV file into `dir`
    #[must_use]
    pub fn with_utterance_dir(mut self, dir: PathBuf) -> Self {
        self.utterance_dir = Some(dir);
        self
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.session.id
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.session.state
    }

    /// Run the session to completion
    ///
    /// The transport is shut down on every exit path.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session: anything whose policy is
    /// [`TurnPolicy::EndSession`], or a turn-scoped error repeated
    /// too many times in a row
    pub async fn run(&mut self) -> Result<SessionSummary> {
        tracing::info!(
            session = %self.session.id,
            strategy = %self.transport.strategy(),
            "session started"
        );

        let outcome = self.run_turns().await;
        self.transport.shutdown().await;

        match &outcome {
            Ok(summary) => tracing::info!(
                session = %self.session.id,
                turns = summary.turns,
                end = ?summary.end,
                underruns = summary.underruns,
                "session ended"
            ),
            Err(e) => tracing::error!(session = %self.session.id, error = %e, "session failed"),
        }
        outcome
    }

    async fn run_turns(&mut self) -> Result<SessionSummary> {
        let mut turns = 0;
        let mut failed_in_a_row = 0;

        let end = loop {
            if self.stop.is_stopped() {
                break EndReason::Stopped;
            }

            match self.run_turn(turns).await {
                Ok(TurnOutcome::Completed) => {
                    turns += 1;
                    failed_in_a_row = 0;
                    self.session.set(SessionState::Idle, None);
                }
                Ok(TurnOutcome::NoSpeech) => break EndReason::NoSpeech,
                Err(Error::Cancelled) => break EndReason::Stopped,
                Err(err) => {
                    let cause = err.to_string();
                    tracing::warn!(turn = turns, error = %cause, "turn failed");
                    self.session.set(SessionState::Error, Some(&cause));
                    self.session.set(SessionState::Idle, None);

                    failed_in_a_row += 1;
                    if err.policy() == TurnPolicy::EndSession || failed_in_a_row >= MAX_FAILED_TURNS
                    {
                        return Err(err);
                    }
                }
            }
        };

        if self.session.state != SessionState::Idle {
            self.session.set(SessionState::Idle, None);
        }

        Ok(SessionSummary {
            turns,
            end,
            underruns: self.scheduler.underruns(),
        })
    }

    async fn run_turn(&mut self, turn: u32) -> Result<TurnOutcome> {
        self.session.set(SessionState::Listening, None);

        // the microphone is held only while capturing
        let utterance = {
            let mut source = self.input.open()?;
            capture_utterance(source.as_mut(), &self.vad, &self.stop).await?
        };

        let Some(utterance) = utterance else {
            tracing::info!(session = %self.session.id, "no speech, ending session");
            return Ok(TurnOutcome::NoSpeech);
        };

        tracing::debug!(
            turn,
            start_ms = utterance.start().as_millis(),
            duration_ms = utterance.duration().as_millis(),
            "utterance captured"
        );
        self.save_utterance(&utterance, turn);

        self.session.set(SessionState::Sending, None);
        let preferred = self.transport.strategy();
        self.scheduler.begin_turn(self.playback.prebuffer_for(preferred));

        let mut stream = self.transport.send(utterance).await?;
        let streamed = stream_reply(
            &mut stream,
            &mut self.session,
            &mut self.scheduler,
            self.playback,
            &self.stop,
        )
        .await;
        drop(stream);

        if matches!(streamed, Err(Error::Cancelled)) {
            // release the media session before playing out what is scheduled
            self.transport.shutdown().await;
        }

        match streamed {
            Ok(()) => {
                self.scheduler.finish()?;
                self.scheduler.drain().await?;
                Ok(TurnOutcome::Completed)
            }
            Err(err) => {
                // let whatever was already scheduled finish before listening again
                self.scheduler.discard_pending();
                if let Err(e) = self.scheduler.drain().await {
                    tracing::warn!(error = %e, "drain after failed turn");
                }
                Err(err)
            }
        }
    }

    fn save_utterance(&self, utterance: &Utterance, turn: u32) {
        let Some(dir) = &self.utterance_dir else {
            return;
        };

        let path = dir.join(format!("{}-{turn:03}.wav", self.session.id));
        let written = utterance
            .to_wav()
            .and_then(|wav| std::fs::write(&path, wav).map_err(Error::from));

        match written {
            Ok(()) => tracing::debug!(path = %path.display(), "utterance saved"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to save utterance"),
        }
    }
}

/// Feed one reply into the scheduler until `Done`
///
/// A media reply is abandoned with `Error::Cancelled` once `stop` fires.
async fn stream_reply(
    stream: &mut ReplyStream<'_>,
    session: &mut Session,
    scheduler: &mut PlaybackScheduler,
    playback: PlaybackConfig,
    stop: &StopHandle,
) -> Result<()> {
    let mut streaming = false;
    let mut frames = 0u64;

    loop {
        let next = if stream.strategy() == Strategy::Media {
            tokio::select! {
                event = stream.next() => event,
                () = stop.stopped() => {
                    tracing::info!(frames, "stop requested during media reply");
                    return Err(Error::Cancelled);
                }
            }
        } else {
            stream.next().await
        };

        let event = match next {
            Some(event) => event?,
            None => {
                return Err(Error::Transport("reply ended without done".to_string()));
            }
        };

        if !streaming {
            streaming = true;
            session.set(SessionState::Streaming, None);
        }

        match event {
            ReplyEvent::Started => tracing::debug!(strategy = %stream.strategy(), "reply started"),
            ReplyEvent::Frame(frame) => {
                if frames == 0 && stream.fell_back() {
                    scheduler.begin_turn(playback.prebuffer_for(stream.strategy()));
                }
                frames += 1;
                scheduler.submit(frame)?;
            }
            ReplyEvent::Error(message) => return Err(Error::Remote(message)),
            ReplyEvent::Done => {
                tracing::debug!(frames, strategy = %stream.strategy(), "reply complete");
                return Ok(());
            }
        }
    }
}
