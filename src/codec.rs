//! Sample codec used at the transport edge
//!
//! Internally audio is always `Vec<f32>` in [-1, 1]. These functions are the
//! only place samples become bytes or base64 text and back.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::audio::SampleEncoding;
use crate::{Error, Result};

/// Encode samples as little-endian PCM bytes
#[must_use]
pub fn encode(samples: &[f32], encoding: SampleEncoding) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * encoding.sample_width());
    match encoding {
        SampleEncoding::F32 => {
            for sample in samples {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
        }
        SampleEncoding::I16 => {
            for &sample in samples {
                bytes.extend_from_slice(&float_to_i16(sample).to_le_bytes());
            }
        }
    }
    bytes
}

/// Decode little-endian PCM bytes into float samples
///
/// # Errors
///
/// Returns `Error::Protocol` if the byte count is not a whole number of samples
pub fn decode(bytes: &[u8], encoding: SampleEncoding) -> Result<Vec<f32>> {
    let width = encoding.sample_width();
    if bytes.len() % width != 0 {
        return Err(Error::Protocol(format!(
            "{} payload of {} bytes is not a multiple of {width}",
            encoding,
            bytes.len()
        )));
    }

    let samples = match encoding {
        SampleEncoding::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        SampleEncoding::I16 => bytes
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
            .collect(),
    };
    Ok(samples)
}

/// Encode samples as base64 text
#[must_use]
pub fn encode_base64(samples: &[f32], encoding: SampleEncoding) -> String {
    STANDARD.encode(encode(samples, encoding))
}

/// Decode base64 text into float samples
///
/// Accepts a bare payload or a `data:` URL.
///
/// # Errors
///
/// Returns `Error::Protocol` if the text is not valid base64 or the payload
/// is not a whole number of samples
pub fn decode_base64(text: &str, encoding: SampleEncoding) -> Result<Vec<f32>> {
    let payload = strip_data_url(text.trim());
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| Error::Protocol(format!("invalid base64 audio chunk: {e}")))?;
    decode(&bytes, encoding)
}

fn strip_data_url(text: &str) -> &str {
    if text.starts_with("data:") {
        text.split_once(',').map_or(text, |(_, payload)| payload)
    } else {
        text
    }
}

#[allow(clippy::cast_possible_truncation)]
fn float_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}
