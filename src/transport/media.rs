//! Negotiated media channel strategy
//!
//! The utterance travels on a continuous media track owned by a
//! [`PeerConnection`]; replies come back as JSON chunk records on the same
//! WebSocket used for signaling. The session is negotiated once and kept
//! across turns until [`ReplyTransport::shutdown`] or the remote hangs up.
//! A turn whose reply never reached its terminal record leaves the remote
//! mid-reply, so the next turn renegotiates on a fresh signaling channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::wire::{self, ControlMessage, IceCandidate, SessionDescription, Signal};
use super::{
    DEFAULT_CONNECT_TIMEOUT, RawReply, RawReplyReceiver, ReplyTransport, Strategy, WireFormat,
    deliver, reply_channel,
};
use crate::segmenter::Utterance;
use crate::{Error, Result};

/// The local end of a negotiated media connection
///
/// Supplied by the embedding application, which owns the actual
/// media stack and is configured with the session's ICE servers.
#[async_trait]
pub trait PeerConnection: Send {
    /// Attach the local capture track and create an offer
    async fn create_offer(&mut self) -> Result<SessionDescription>;

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    /// Candidates discovered locally, in discovery order
    ///
    /// Taken once per negotiation.
    fn take_local_candidates(&mut self) -> Option<mpsc::Receiver<IceCandidate>>;

    /// Push utterance audio onto the media track
    async fn send_audio(&mut self, samples: &[f32], sample_rate: u32) -> Result<()>;

    /// Stop the local track and tear the connection down
    async fn close(&mut self);
}

type SharedPeer = Arc<Mutex<Box<dyn PeerConnection>>>;
type TurnSlot = Arc<Mutex<Option<mpsc::Sender<Result<RawReply>>>>>;

struct Session {
    outbound: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Media channel with replies on the signaling socket
pub struct MediaChannelTransport {
    endpoint: String,
    peer: SharedPeer,
    format: WireFormat,
    handshake_timeout: Duration,
    connect_timeout: Duration,
    turn: TurnSlot,
    session: Option<Session>,
    /// An offer was created and the peer not closed since
    peer_active: bool,
}

impl MediaChannelTransport {
    #[must_use]
    pub fn new(
        endpoint: String,
        peer: Box<dyn PeerConnection>,
        format: WireFormat,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            peer: Arc::new(Mutex::new(peer)),
            format,
            handshake_timeout,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            turn: Arc::new(Mutex::new(None)),
            session: None,
            peer_active: false,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Offer, open the control channel, apply the answer
    async fn negotiate(&mut self) -> Result<Session> {
        let (offer, candidates) = {
            let mut peer = self.peer.lock().await;
            (peer.create_offer().await?, peer.take_local_candidates())
        };
        self.peer_active = true;

        let connect = connect_async(self.endpoint.as_str());
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "signaling connect timed out after {} ms",
                    self.connect_timeout.as_millis()
                ))
            })??;
        let (mut sink, mut stream) = ws.split();
        tracing::debug!(endpoint = %self.endpoint, "signaling channel connected");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let closed = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::new();

        outbound
            .send(signal_message(&Signal::Offer(offer))?)
            .map_err(|_| Error::Transport("signaling writer stopped".to_string()))?;

        tasks.push(tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(error = %e, "signaling send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        }));

        if let Some(mut candidates) = candidates {
            let outbound = outbound.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(candidate) = candidates.recv().await {
                    let Ok(message) = signal_message(&Signal::Ice(candidate)) else {
                        continue;
                    };
                    if outbound.send(message).is_err() {
                        break;
                    }
                }
            }));
        }

        let (answer_tx, answer_rx) = oneshot::channel();
        let control = ControlReader {
            peer: Arc::clone(&self.peer),
            turn: Arc::clone(&self.turn),
            format: self.format,
            answer: Some(answer_tx),
        };
        let reader_closed = Arc::clone(&closed);
        tasks.push(tokio::spawn(async move {
            control.run(&mut stream).await;
            reader_closed.store(true, Ordering::SeqCst);
        }));

        let session = Session {
            outbound,
            closed,
            tasks,
        };

        let answer = match tokio::time::timeout(self.handshake_timeout, answer_rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => {
                close_session(session);
                return Err(Error::Transport(
                    "signaling channel closed before answer".to_string(),
                ));
            }
            Err(_) => {
                close_session(session);
                return Err(Error::Transport(format!(
                    "no answer within {} ms",
                    self.handshake_timeout.as_millis()
                )));
            }
        };

        if let Err(err) = self.peer.lock().await.apply_answer(answer).await {
            close_session(session);
            return Err(err);
        }

        tracing::debug!("media channel negotiated");
        Ok(session)
    }
}

#[async_trait]
impl ReplyTransport for MediaChannelTransport {
    fn strategy(&self) -> Strategy {
        Strategy::Media
    }

    async fn open(&mut self, utterance: Arc<Utterance>) -> Result<RawReplyReceiver> {
        let (tx, rx) = reply_channel();
        let unfinished = self.turn.lock().await.replace(tx).is_some();

        if let Some(session) = self.session.take_if(|_| unfinished) {
            tracing::debug!("previous reply unfinished, renegotiating");
            close_session(session);
        }

        if !self.session.as_ref().is_some_and(Session::is_open) {
            if let Some(stale) = self.session.take() {
                close_session(stale);
            }
            match self.negotiate().await {
                Ok(session) => self.session = Some(session),
                Err(err) => {
                    self.turn.lock().await.take();
                    return Err(err);
                }
            }
        }

        let sent = self
            .peer
            .lock()
            .await
            .send_audio(&utterance.samples(), utterance.sample_rate())
            .await;
        if let Err(err) = sent {
            self.turn.lock().await.take();
            return Err(err);
        }

        Ok(rx)
    }

    async fn shutdown(&mut self) {
        self.turn.lock().await.take();
        if let Some(session) = self.session.take() {
            close_session(session);
        }
        if std::mem::take(&mut self.peer_active) {
            self.peer.lock().await.close().await;
            tracing::debug!("media channel released");
        }
    }
}

fn close_session(session: Session) {
    session.closed.store(true, Ordering::SeqCst);
    drop(session.outbound);
    for task in session.tasks {
        task.abort();
    }
}

fn signal_message(signal: &Signal) -> Result<Message> {
    Ok(Message::Text(serde_json::to_string(signal)?.into()))
}

/// Dispatches control channel traffic
struct ControlReader {
    peer: SharedPeer,
    turn: TurnSlot,
    format: WireFormat,
    answer: Option<oneshot::Sender<SessionDescription>>,
}

impl ControlReader {
    async fn run<S>(mut self, stream: &mut S)
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.dispatch(text.as_str()).await,
                Ok(Message::Binary(_)) => {
                    self.to_turn(Err(Error::Protocol(
                        "binary message on the control channel".to_string(),
                    )))
                    .await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    self.to_turn(Err(err.into())).await;
                    return;
                }
            }
        }

        self.to_turn(Err(Error::Transport(
            "signaling channel closed".to_string(),
        )))
        .await;
    }

    async fn dispatch(&mut self, text: &str) {
        match wire::parse_control(text) {
            Ok(ControlMessage::Answer(answer)) => match self.answer.take() {
                Some(tx) => {
                    let _ = tx.send(answer);
                }
                None => tracing::warn!("ignoring repeated answer"),
            },
            Ok(ControlMessage::RemoteCandidate(candidate)) => {
                if let Err(e) = self.peer.lock().await.add_remote_candidate(candidate).await {
                    tracing::warn!(error = %e, "remote candidate rejected");
                }
            }
            Ok(ControlMessage::Reply(record)) => {
                self.to_turn(record.into_reply(self.format)).await;
            }
            Err(err) => self.to_turn(Err(err)).await,
        }
    }

    /// Route a reply to the turn in progress, if any
    async fn to_turn(&self, reply: Result<RawReply>) {
        let mut slot = self.turn.lock().await;
        let Some(tx) = slot.as_ref() else {
            tracing::debug!("control message outside a turn");
            return;
        };
        if !deliver(tx, reply).await {
            slot.take();
        }
    }
}
