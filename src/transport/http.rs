//! Chunked HTTP strategy: one POST, newline-delimited JSON reply

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::wire::{self, HttpRequestBody};
use super::{
    DEFAULT_CONNECT_TIMEOUT, RawReply, RawReplyReceiver, ReplyTransport, Strategy, WireFormat,
    deliver, reply_channel,
};
use crate::segmenter::Utterance;
use crate::{Error, Result, codec};

/// Posts the whole utterance and streams the response body
pub struct ChunkedHttpTransport {
    client: reqwest::Client,
    url: String,
    format: WireFormat,
}

impl ChunkedHttpTransport {
    #[must_use]
    pub fn new(url: String, format: WireFormat) -> Self {
        Self {
            client: client(DEFAULT_CONNECT_TIMEOUT),
            url,
            format,
        }
    }

    /// Give up on an endpoint that does not accept the connection in time
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.client = client(timeout);
        self
    }
}

fn client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to build HTTP client, using defaults");
            reqwest::Client::new()
        })
}

#[async_trait]
impl ReplyTransport for ChunkedHttpTransport {
    fn strategy(&self) -> Strategy {
        Strategy::Http
    }

    async fn open(&mut self, utterance: Arc<Utterance>) -> Result<RawReplyReceiver> {
        let body = HttpRequestBody {
            audio: codec::encode_base64(&utterance.samples(), self.format.encoding),
            sample_rate: self.format.sample_rate,
            encoding: self.format.encoding,
        };

        let response = self.client.post(&self.url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %text, "reply request failed");
            return Err(Error::Transport(format!("HTTP {status}: {text}")));
        }

        tracing::debug!(url = %self.url, "reply stream opened");

        let (tx, rx) = reply_channel();
        let format = self.format;
        let mut body = response.bytes_stream();

        tokio::spawn(async move {
            let mut lines = LineBuffer::default();

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        deliver(&tx, Err(Error::Http(err))).await;
                        return;
                    }
                };

                for line in lines.push(&bytes) {
                    if !deliver(&tx, decode_line(&line, format)).await {
                        return;
                    }
                }
            }

            if let Some(line) = lines.finish() {
                if !deliver(&tx, decode_line(&line, format)).await {
                    return;
                }
            }

            // a cleanly finished body ends the reply
            deliver(&tx, Ok(RawReply::Done)).await;
        });

        Ok(rx)
    }
}

fn decode_line(line: &str, format: WireFormat) -> Result<RawReply> {
    wire::parse_record(line)?.into_reply(format)
}

/// Splits a byte stream into non-empty lines
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and return every line they complete
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Whatever trails the last newline
    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}
