//! PCM buffers and their transport encodings.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::{MediaError, Result};

/// A batch of mono 16-bit PCM at a declared sample rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    /// Little-endian PCM16 wrapped in standard base64.
    pub fn to_base64(&self) -> String {
        encode_base64_pcm(&self.samples)
    }
}

/// Synthesized audio received from a duplex upstream, still transport-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseAudio {
    /// Base64 little-endian PCM16.
    pub data: String,
    pub sample_rate: u32,
}

pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Reassemble little-endian PCM16. A trailing odd byte is ignored.
pub fn le_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn encode_base64_pcm(samples: &[i16]) -> String {
    STANDARD.encode(samples_to_le_bytes(samples))
}

pub fn decode_base64_pcm(data: &str) -> Result<Vec<i16>> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| MediaError::Transport(format!("invalid base64 audio: {e}")))?;
    Ok(le_bytes_to_samples(&bytes))
}

/// Extract the `rate=` parameter from a mime type such as `audio/pcm;rate=24000`.
pub fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}
