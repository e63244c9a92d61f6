//! PCM frame encoding
//!
//! Converts captured float frames into the 16-bit little-endian PCM the live
//! session expects, and decodes the model's 16-bit PCM back into floats for
//! playback.

use base64::engine::general_purpose;
use base64::Engine;

/// Capture sample rate sent to the model.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of the audio the model streams back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per captured frame (16 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty audio frame")]
    EmptyFrame,

    #[error("PCM payload has odd length ({0} bytes)")]
    OddLength(usize),
}

/// MIME descriptor for mono 16-bit PCM at `rate`.
pub fn pcm_mime(rate: u32) -> String {
    format!("audio/pcm;rate={}", rate)
}

/// One encoded capture frame, ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    data: Vec<u8>,
    mime_type: String,
}

impl EncodedChunk {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.data)
    }
}

/// Encode a float frame captured at [`INPUT_SAMPLE_RATE`].
pub fn encode_frame(frame: &[f32]) -> Result<EncodedChunk, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::EmptyFrame);
    }

    let mut data = Vec::with_capacity(frame.len() * 2);
    for &sample in frame {
        // `as` saturates, so +1.0 lands on i16::MAX instead of wrapping
        let value = (sample.clamp(-1.0, 1.0) * 32768.0) as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }

    Ok(EncodedChunk {
        data,
        mime_type: pcm_mime(INPUT_SAMPLE_RATE),
    })
}

/// Decode 16-bit little-endian PCM into floats in [-1, 1).
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}
