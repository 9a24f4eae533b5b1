//! Duplex WebSocket strategies (binary PCM and JSON records)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::wire::{self, END_OF_INPUT, OutboundRecord, ReplyRecord};
use super::{
    DEFAULT_CONNECT_TIMEOUT, RawReply, RawReplyReceiver, ReplyTransport, Strategy, WireFormat,
    deliver, reply_channel,
};
use crate::segmenter::Utterance;
use crate::{Error, Result, codec};

/// How audio is framed on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Raw PCM binary messages, utterance closed by the `EOS` sentinel
    Binary,
    /// Base64 chunks inside JSON records
    Json,
}

/// A fresh WebSocket connection per turn
pub struct SocketTransport {
    mode: SocketMode,
    endpoint: String,
    format: WireFormat,
    connect_timeout: Duration,
}

impl SocketTransport {
    #[must_use]
    pub const fn new(mode: SocketMode, endpoint: String, format: WireFormat) -> Self {
        Self {
            mode,
            endpoint,
            format,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Give up on an endpoint that has not completed the upgrade in time
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn outbound(&self, utterance: &Utterance) -> Result<Vec<Message>> {
        let encoding = self.format.encoding;
        let mut messages = Vec::with_capacity(utterance.frames().len() + 1);

        match self.mode {
            SocketMode::Binary => {
                for frame in utterance.frames() {
                    messages.push(Message::Binary(
                        codec::encode(frame.samples(), encoding).into(),
                    ));
                }
                messages.push(Message::Text(END_OF_INPUT.into()));
            }
            SocketMode::Json => {
                for frame in utterance.frames() {
                    let record = OutboundRecord::Audio {
                        chunk: codec::encode_base64(frame.samples(), encoding),
                        sample_rate: self.format.sample_rate,
                        encoding,
                    };
                    messages.push(Message::Text(serde_json::to_string(&record)?.into()));
                }
                messages.push(Message::Text(
                    serde_json::to_string(&OutboundRecord::End)?.into(),
                ));
            }
        }

        Ok(messages)
    }
}

#[async_trait]
impl ReplyTransport for SocketTransport {
    fn strategy(&self) -> Strategy {
        match self.mode {
            SocketMode::Binary => Strategy::Binary,
            SocketMode::Json => Strategy::Json,
        }
    }

    async fn open(&mut self, utterance: Arc<Utterance>) -> Result<RawReplyReceiver> {
        let messages = self.outbound(&utterance)?;

        let connect = connect_async(self.endpoint.as_str());
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "connect to {} timed out after {} ms",
                    self.endpoint,
                    self.connect_timeout.as_millis()
                ))
            })??;
        let (mut sink, mut stream) = ws.split();

        tracing::debug!(
            endpoint = %self.endpoint,
            mode = ?self.mode,
            messages = messages.len(),
            "socket connected, sending utterance"
        );

        for message in messages {
            sink.send(message).await?;
        }

        let (tx, rx) = reply_channel();
        let mode = self.mode;
        let format = self.format;

        tokio::spawn(async move {
            let mut reader = SocketReader {
                mode,
                format,
                declared_rate: None,
            };

            while let Some(message) = stream.next().await {
                let reply = match message {
                    Ok(message) => match reader.read(message) {
                        Ok(Some(reply)) => Ok(reply),
                        Ok(None) => continue,
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(Error::from(err)),
                };

                if !deliver(&tx, reply).await {
                    break;
                }
            }

            let _ = sink.close().await;
            tracing::debug!("socket reply finished");
        });

        Ok(rx)
    }
}

/// Per-connection reply decoder
struct SocketReader {
    mode: SocketMode,
    format: WireFormat,
    /// Rate announced by a header record for the next binary message
    declared_rate: Option<u32>,
}

impl SocketReader {
    /// Decode one message; `Ok(None)` for messages that carry no reply
    fn read(&mut self, message: Message) -> Result<Option<RawReply>> {
        match message {
            Message::Binary(data) => {
                if self.mode == SocketMode::Json {
                    return Err(Error::Protocol(
                        "binary message on a JSON socket".to_string(),
                    ));
                }
                let samples = codec::decode(&data[..], self.format.encoding)?;
                let sample_rate = self.declared_rate.take().unwrap_or(self.format.sample_rate);
                Ok(Some(RawReply::Audio {
                    samples,
                    sample_rate,
                }))
            }
            Message::Text(text) => {
                let record = wire::parse_record(text.as_str())?;
                match record {
                    ReplyRecord::Chunk {
                        chunk: None,
                        sample_rate,
                    } if self.mode == SocketMode::Binary => {
                        self.declared_rate = sample_rate;
                        Ok(None)
                    }
                    record => record.into_reply(self.format).map(Some),
                }
            }
            Message::Close(_) => Err(Error::Transport("socket closed by remote".to_string())),
            _ => Ok(None),
        }
    }
}
