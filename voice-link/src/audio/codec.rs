//! Wire codec for PCM audio frames.
//!
//! Outbound: f32 samples -> clamped 16-bit little-endian PCM -> base64,
//! tagged `audio/pcm;rate=16000`.
//! Inbound: base64 -> 16-bit little-endian PCM at 24 kHz mono -> f32.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::playback::PlaybackBuffer;

/// Sample rate of audio sent to the remote service.
pub const OUTBOUND_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized speech returned by the remote service.
pub const INBOUND_SAMPLE_RATE: u32 = 24_000;

/// Rate descriptor attached to every outbound frame.
pub const OUTBOUND_RATE_TAG: &str = "audio/pcm;rate=16000";

/// One encoded block of microphone audio, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "data")]
    pub payload: String,
    #[serde(rename = "mimeType")]
    pub rate_tag: &'static str,
}

/// One encoded block of synthesized speech, as received.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "data")]
    pub payload: String,
}

impl InboundFrame {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Reasons an inbound frame cannot be turned into audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload is not valid base64.
    Encoding(String),
    /// Decoded byte count is not a whole number of 16-bit samples.
    OddLength(usize),
    /// Payload decoded to zero samples.
    Empty,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encoding(msg) => write!(f, "Malformed base64 payload: {}", msg),
            Self::OddLength(n) => write!(f, "PCM payload has odd byte count: {}", n),
            Self::Empty => write!(f, "PCM payload is empty"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Quantize one sample to i16 with the same 32768 scale the decoder uses.
/// +1.0 saturates at 32767.
fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    (s * 32768.0).round().min(32767.0) as i16
}

/// Encode mono f32 samples into an outbound wire frame.
pub fn encode_frame(samples: &[f32]) -> OutboundFrame {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    OutboundFrame {
        payload: BASE64.encode(&bytes),
        rate_tag: OUTBOUND_RATE_TAG,
    }
}

/// Build a frame of digital silence lasting `duration_ms` at the outbound rate.
pub fn silence_frame(duration_ms: u32) -> OutboundFrame {
    let samples = (OUTBOUND_SAMPLE_RATE as u64 * duration_ms as u64 / 1000) as usize;
    encode_frame(&vec![0.0; samples])
}

/// Decode an inbound frame into a playable buffer at the inbound rate.
pub fn decode_frame(frame: &InboundFrame) -> Result<PlaybackBuffer, CodecError> {
    let bytes = BASE64
        .decode(frame.payload.trim())
        .map_err(|e| CodecError::Encoding(e.to_string()))?;

    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(PlaybackBuffer::new(samples, INBOUND_SAMPLE_RATE, 1))
}
