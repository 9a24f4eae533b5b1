//! JSON records exchanged with the remote agent

use serde::{Deserialize, Serialize};

use super::{RawReply, WireFormat};
use crate::audio::SampleEncoding;
use crate::{Error, Result, codec};

/// Sentinel text message ending the outbound utterance in binary mode
pub const END_OF_INPUT: &str = "EOS";

/// Reply-side control record, one per line or message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplyRecord {
    Started,
    Chunk {
        /// Base64 payload; absent when the audio follows as a binary message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
    },
    Done,
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ReplyRecord {
    /// Decode into a reply, using the session format for anything undeclared
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for a chunk without a payload or with an
    /// undecodable one
    pub fn into_reply(self, format: WireFormat) -> Result<RawReply> {
        Ok(match self {
            Self::Started => RawReply::Started,
            Self::Done => RawReply::Done,
            Self::Error { message } => RawReply::Error(message),
            Self::Chunk { chunk, sample_rate } => {
                let payload = chunk.ok_or_else(|| {
                    Error::Protocol("chunk record carries no audio".to_string())
                })?;
                RawReply::Audio {
                    samples: codec::decode_base64(&payload, format.encoding)?,
                    sample_rate: sample_rate.unwrap_or(format.sample_rate),
                }
            }
        })
    }
}

/// Parse a reply record
///
/// # Errors
///
/// Returns `Error::Protocol` for malformed JSON or an unknown record type
pub fn parse_record(text: &str) -> Result<ReplyRecord> {
    serde_json::from_str(text.trim())
        .map_err(|e| Error::Protocol(format!("malformed reply record: {e}")))
}

/// Outbound record on the JSON socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundRecord {
    Audio {
        chunk: String,
        sample_rate: u32,
        encoding: SampleEncoding,
    },
    End,
}

/// Body of the chunked HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestBody {
    pub audio: String,
    pub sample_rate: u32,
    pub encoding: SampleEncoding,
}

/// Session description exchanged during the media handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// Network candidate discovered by either peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

/// Signaling message sent by the local peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Offer(SessionDescription),
    Ice(IceCandidate),
}

/// Anything the remote side sends on the media control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Answer(SessionDescription),
    RemoteCandidate(IceCandidate),
    Reply(ReplyRecord),
}

/// Parse a message from the media control channel
///
/// # Errors
///
/// Returns `Error::Protocol` if the message is neither a signaling message
/// nor a reply record
pub fn parse_control(text: &str) -> Result<ControlMessage> {
    let mut value: serde_json::Value = serde_json::from_str(text.trim())
        .map_err(|e| Error::Protocol(format!("malformed control message: {e}")))?;

    let invalid = |e: serde_json::Error| Error::Protocol(format!("malformed control message: {e}"));

    if let Some(answer) = value.get_mut("answer").map(serde_json::Value::take) {
        return Ok(ControlMessage::Answer(
            serde_json::from_value(answer).map_err(invalid)?,
        ));
    }
    if let Some(ice) = value.get_mut("ice").map(serde_json::Value::take) {
        return Ok(ControlMessage::RemoteCandidate(
            serde_json::from_value(ice).map_err(invalid)?,
        ));
    }
    if value.get("type").is_some() {
        return Ok(ControlMessage::Reply(
            serde_json::from_value(value).map_err(invalid)?,
        ));
    }

    Err(Error::Protocol(format!(
        "unexpected control message: {}",
        text.chars().take(80).collect::<String>()
    )))
}
