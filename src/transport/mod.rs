//! Reply transport
//!
//! Carries a captured utterance to the remote agent and turns whatever comes
//! back into one ordered stream of [`ReplyEvent`]s. Four wire strategies sit
//! behind the [`ReplyTransport`] trait; [`TransportAdapter`] picks one from
//! configuration and falls back to a second one at most once per turn.

mod http;
mod media;
mod socket;
pub mod wire;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::audio::{self, SampleEncoding};
use crate::config::TransportConfig;
use crate::segmenter::Utterance;
use crate::{Error, Result};

pub use http::ChunkedHttpTransport;
pub use media::{MediaChannelTransport, PeerConnection};
pub use socket::{SocketMode, SocketTransport};
pub use wire::{IceCandidate, SessionDescription};

/// Reply events buffered between a strategy's reader task and the turn
const REPLY_QUEUE: usize = 64;

/// Connect timeout for strategies built without a configuration
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire strategy
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Raw PCM over a duplex WebSocket, ended by a sentinel
    Binary,
    /// JSON records with base64 chunks over a duplex WebSocket
    Json,
    /// One POST, newline-delimited JSON reply body
    Http,
    /// Negotiated media channel with replies on the signaling socket
    Media,
}

impl Strategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
            Self::Http => "http",
            Self::Media => "media",
        }
    }

    /// Whether replies should be pre-buffered before playback starts
    #[must_use]
    pub const fn prebuffers_by_default(self) -> bool {
        matches!(self, Self::Http)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "binary" | "ws" | "websocket" => Ok(Self::Binary),
            "json" => Ok(Self::Json),
            "http" | "chunked" => Ok(Self::Http),
            "media" | "webrtc" => Ok(Self::Media),
            other => Err(Error::Config(format!("unknown transport strategy: {other}"))),
        }
    }
}

/// Session-wide sample format agreed with the remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    pub sample_rate: u32,
    pub encoding: SampleEncoding,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self {
            sample_rate: audio::SAMPLE_RATE,
            encoding: SampleEncoding::F32,
        }
    }
}

/// What a strategy produces before sequencing and validation
#[derive(Debug, Clone, PartialEq)]
pub enum RawReply {
    Started,
    Audio { samples: Vec<f32>, sample_rate: u32 },
    Error(String),
    Done,
}

/// Receiving half of a strategy's reply channel
pub type RawReplyReceiver = mpsc::Receiver<Result<RawReply>>;

/// Create the channel a strategy feeds its replies into
#[must_use]
pub fn reply_channel() -> (mpsc::Sender<Result<RawReply>>, RawReplyReceiver) {
    mpsc::channel(REPLY_QUEUE)
}

/// Hand a reply to the turn; `false` once the reader should stop
async fn deliver(tx: &mpsc::Sender<Result<RawReply>>, reply: Result<RawReply>) -> bool {
    let last = !matches!(reply, Ok(RawReply::Started | RawReply::Audio { .. }));
    tx.send(reply).await.is_ok() && !last
}

/// One wire strategy
#[async_trait]
pub trait ReplyTransport: Send {
    fn strategy(&self) -> Strategy;

    /// Send `utterance` and return the channel its reply arrives on
    ///
    /// Errors returned here, and transport-class errors arriving on the
    /// channel before any audio, let the adapter fall back.
    async fn open(&mut self, utterance: Arc<Utterance>) -> Result<RawReplyReceiver>;

    /// Release any connection held across turns
    async fn shutdown(&mut self) {}
}

/// A decoded reply buffer, tagged with its arrival order within the turn
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFrame {
    pub seq: u64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl ReplyFrame {
    #[must_use]
    pub fn duration(&self) -> Duration {
        audio::samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// Event on a turn's reply stream
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    Started,
    Frame(ReplyFrame),
    /// The remote agent reported a failure; the stream ends here
    Error(String),
    Done,
}

/// Selects a strategy from configuration and applies the fallback policy
pub struct TransportAdapter {
    preferred: Box<dyn ReplyTransport>,
    fallback: Option<Box<dyn ReplyTransport>>,
    format: WireFormat,
}

impl TransportAdapter {
    #[must_use]
    pub fn new(
        preferred: Box<dyn ReplyTransport>,
        fallback: Option<Box<dyn ReplyTransport>>,
        format: WireFormat,
    ) -> Self {
        Self {
            preferred,
            fallback,
            format,
        }
    }

    /// Build the configured strategies
    ///
    /// `peer` is required when either strategy is `media`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a media strategy is configured without a peer
    pub fn from_config(
        config: &TransportConfig,
        format: WireFormat,
        mut peer: Option<Box<dyn PeerConnection>>,
    ) -> Result<Self> {
        let preferred = build_strategy(config.strategy, config, format, &mut peer)?;
        let fallback_strategy = config.fallback_strategy();
        let fallback = fallback_strategy
            .map(|strategy| build_strategy(strategy, config, format, &mut peer))
            .transpose()?;

        tracing::debug!(
            strategy = %config.strategy,
            fallback = ?fallback_strategy,
            sample_rate = format.sample_rate,
            encoding = %format.encoding,
            "transport configured"
        );

        Ok(Self::new(preferred, fallback, format))
    }

    #[must_use]
    pub const fn format(&self) -> WireFormat {
        self.format
    }

    /// Strategy that replies are normally expected on
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.preferred.strategy()
    }

    /// Send an utterance and stream back the reply
    ///
    /// The returned stream borrows the adapter, so a second turn cannot start
    /// until this one's stream is dropped.
    ///
    /// # Errors
    ///
    /// Returns the preferred strategy's error when there is no fallback, or
    /// `Error::Transport` naming both failures when the fallback fails too
    pub async fn send(&mut self, utterance: Utterance) -> Result<ReplyStream<'_>> {
        let utterance = Arc::new(utterance);
        let preferred = self.preferred.strategy();

        tracing::debug!(
            %preferred,
            duration_ms = utterance.duration().as_millis(),
            "sending utterance"
        );

        match self.preferred.open(Arc::clone(&utterance)).await {
            Ok(rx) => Ok(ReplyStream {
                adapter: self,
                rx,
                utterance,
                active: preferred,
                fell_back: false,
                next_seq: 0,
                finished: false,
            }),
            Err(err) if err.is_transport() && self.fallback.is_some() => {
                let mut stream = ReplyStream {
                    adapter: self,
                    rx: reply_channel().1,
                    utterance,
                    active: preferred,
                    fell_back: false,
                    next_seq: 0,
                    finished: false,
                };
                stream.fall_back(err).await?;
                Ok(stream)
            }
            Err(err) => Err(err),
        }
    }

    /// Release connections held by both strategies
    pub async fn shutdown(&mut self) {
        self.preferred.shutdown().await;
        if let Some(fallback) = self.fallback.as_mut() {
            fallback.shutdown().await;
        }
    }
}

fn build_strategy(
    strategy: Strategy,
    config: &TransportConfig,
    format: WireFormat,
    peer: &mut Option<Box<dyn PeerConnection>>,
) -> Result<Box<dyn ReplyTransport>> {
    Ok(match strategy {
        Strategy::Binary => Box::new(
            SocketTransport::new(SocketMode::Binary, config.endpoint.clone(), format)
                .with_connect_timeout(config.connect_timeout()),
        ),
        Strategy::Json => Box::new(
            SocketTransport::new(SocketMode::Json, config.endpoint.clone(), format)
                .with_connect_timeout(config.connect_timeout()),
        ),
        Strategy::Http => Box::new(
            ChunkedHttpTransport::new(config.http_url.clone(), format)
                .with_connect_timeout(config.connect_timeout()),
        ),
        Strategy::Media => {
            let peer = peer.take().ok_or_else(|| {
                Error::Config("media strategy needs a peer connection".to_string())
            })?;
            Box::new(
                MediaChannelTransport::new(
                    config.endpoint.clone(),
                    peer,
                    format,
                    Duration::from_millis(config.handshake_timeout_ms),
                )
                .with_connect_timeout(config.connect_timeout()),
            )
        }
    })
}

/// One turn's reply
pub struct ReplyStream<'a> {
    adapter: &'a mut TransportAdapter,
    rx: RawReplyReceiver,
    utterance: Arc<Utterance>,
    active: Strategy,
    fell_back: bool,
    next_seq: u64,
    finished: bool,
}

impl ReplyStream<'_> {
    /// Strategy currently delivering the reply
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.active
    }

    /// Whether the fallback strategy took over this turn
    #[must_use]
    pub const fn fell_back(&self) -> bool {
        self.fell_back
    }

    /// Next reply event; `None` after `Done`, a remote error, or a failure
    pub async fn next(&mut self) -> Option<Result<ReplyEvent>> {
        if self.finished {
            return None;
        }

        loop {
            let item = match self.rx.recv().await {
                Some(item) => item,
                None => Err(Error::Transport(format!(
                    "{} reply ended without done",
                    self.active
                ))),
            };

            let event = match item {
                Ok(raw) => self.sequence(raw),
                Err(err) => Err(err),
            };

            match event {
                Err(err) if err.is_transport() && self.may_fall_back() => {
                    if let Err(err) = self.fall_back(err).await {
                        self.finished = true;
                        return Some(Err(err));
                    }
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                Ok(event) => {
                    if matches!(event, ReplyEvent::Done | ReplyEvent::Error(_)) {
                        self.finished = true;
                    }
                    return Some(Ok(event));
                }
            }
        }
    }

    fn sequence(&mut self, raw: RawReply) -> Result<ReplyEvent> {
        Ok(match raw {
            RawReply::Started => ReplyEvent::Started,
            RawReply::Audio {
                samples,
                sample_rate,
            } => {
                let expected = self.adapter.format.sample_rate;
                if sample_rate != expected {
                    return Err(Error::Protocol(format!(
                        "reply chunk declared {sample_rate} Hz, session runs at {expected} Hz"
                    )));
                }
                let seq = self.next_seq;
                self.next_seq += 1;
                ReplyEvent::Frame(ReplyFrame {
                    seq,
                    samples,
                    sample_rate,
                })
            }
            RawReply::Error(message) => ReplyEvent::Error(message),
            RawReply::Done => ReplyEvent::Done,
        })
    }

    fn may_fall_back(&self) -> bool {
        !self.fell_back && self.next_seq == 0 && self.adapter.fallback.is_some()
    }

    /// Switch to the fallback strategy; called at most once per turn
    async fn fall_back(&mut self, cause: Error) -> Result<()> {
        let Some(fallback) = self.adapter.fallback.as_mut() else {
            return Err(cause);
        };
        self.fell_back = true;

        let from = self.active;
        let to = fallback.strategy();
        tracing::warn!(%from, %to, error = %cause, "preferred transport failed, falling back");

        match fallback.open(Arc::clone(&self.utterance)).await {
            Ok(rx) => {
                self.rx = rx;
                self.active = to;
                Ok(())
            }
            Err(err) => Err(Error::Transport(format!(
                "{from} failed ({cause}); fallback {to} failed ({err})"
            ))),
        }
    }
}
