//! Opus codec adapter and integer-ratio resampling.
//!
//! All Opus work happens at 48 kHz mono with 20 ms frames (960 samples).

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Bitrate, Channels, MutSignals, SampleRate};

use crate::error::{MediaError, Result};

/// Wire sample rate of the WebRTC leg.
pub const WIRE_SAMPLE_RATE: u32 = 48_000;

/// Samples per 20 ms frame at 48 kHz.
pub const FRAME_SAMPLES: usize = 960;

/// Largest frame Opus may decode into (120 ms at 48 kHz).
const MAX_DECODED_SAMPLES: usize = 5760;

/// Upper bound on an encoded Opus packet.
const MAX_OPUS_PACKET_BYTES: usize = 4000;

/// A 20 ms CELT silence frame, sent in place of frames that fail to encode.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Turns one Opus payload into PCM.
pub trait FrameDecoder: Send {
    fn decode_frame(&mut self, payload: &[u8]) -> Result<Vec<i16>>;
}

/// Turns exactly one frame of PCM into an Opus payload.
pub trait FrameEncoder: Send {
    fn encode_frame(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;
}

pub struct OpusDecoder {
    decoder: Decoder,
    buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Mono)
            .map_err(|e| MediaError::Codec(format!("failed to create Opus decoder: {e}")))?;
        Ok(Self {
            decoder,
            buffer: vec![0i16; MAX_DECODED_SAMPLES],
        })
    }
}

impl FrameDecoder for OpusDecoder {
    fn decode_frame(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        let packet = audiopus::packet::Packet::try_from(payload)
            .map_err(|e| MediaError::Codec(format!("invalid Opus packet: {e}")))?;
        let signals = MutSignals::try_from(self.buffer.as_mut_slice())
            .map_err(|e| MediaError::Codec(format!("invalid output buffer: {e}")))?;
        let decoded = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|e| MediaError::Codec(format!("Opus decode failed: {e}")))?;
        Ok(self.buffer[..decoded].to_vec())
    }
}

pub struct OpusEncoder {
    encoder: Encoder,
    buffer: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(bitrate: i32) -> Result<Self> {
        let mut encoder = Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)
            .map_err(|e| MediaError::Codec(format!("failed to create Opus encoder: {e}")))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate))
            .map_err(|e| MediaError::Codec(format!("failed to set bitrate {bitrate}: {e}")))?;
        Ok(Self {
            encoder,
            buffer: vec![0u8; MAX_OPUS_PACKET_BYTES],
        })
    }
}

impl FrameEncoder for OpusEncoder {
    fn encode_frame(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(MediaError::Codec(format!(
                "expected {FRAME_SAMPLES} samples per frame, got {}",
                pcm.len()
            )));
        }
        let len = self
            .encoder
            .encode(pcm, &mut self.buffer)
            .map_err(|e| MediaError::Codec(format!("Opus encode failed: {e}")))?;
        Ok(self.buffer[..len].to_vec())
    }
}

/// Nearest-neighbour resampling between rates with an integer ratio.
///
/// Downsampling by `R` keeps every `R`-th sample (`floor(len / R)` outputs);
/// upsampling by `R` repeats each sample `R` times (`len * R` outputs).
/// There is no anti-aliasing filter, so content above the target Nyquist
/// frequency folds back into the band.
pub fn resample(samples: &[i16], from: u32, to: u32) -> Result<Vec<i16>> {
    if from == 0 || to == 0 {
        return Err(MediaError::UnsupportedRatio { from, to });
    }
    if from == to {
        return Ok(samples.to_vec());
    }
    if from > to && from % to == 0 {
        let ratio = (from / to) as usize;
        return Ok(samples.iter().step_by(ratio).take(samples.len() / ratio).copied().collect());
    }
    if to > from && to % from == 0 {
        let ratio = (to / from) as usize;
        let mut out = Vec::with_capacity(samples.len() * ratio);
        for &s in samples {
            out.extend(std::iter::repeat_n(s, ratio));
        }
        return Ok(out);
    }
    Err(MediaError::UnsupportedRatio { from, to })
}

/// Split PCM into whole frames, zero-padding the last partial one.
pub fn split_frames(samples: &[i16]) -> Vec<[i16; FRAME_SAMPLES]> {
    samples
        .chunks(FRAME_SAMPLES)
        .map(|chunk| {
            let mut frame = [0i16; FRAME_SAMPLES];
            frame[..chunk.len()].copy_from_slice(chunk);
            frame
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_length_law() {
        for len in [0usize, 1, 2, 3, 4, 959, 960, 24_000, 24_001] {
            let input = vec![0i16; len];
            let out = resample(&input, 48_000, 16_000).unwrap();
            assert_eq!(out.len(), len / 3, "len {len}");
            let out = resample(&input, 48_000, 24_000).unwrap();
            assert_eq!(out.len(), len / 2, "len {len}");
        }
    }

    #[test]
    fn test_upsample_length_law() {
        for len in [0usize, 1, 480, 961] {
            let input = vec![7i16; len];
            let out = resample(&input, 24_000, 48_000).unwrap();
            assert_eq!(out.len(), len * 2);
            let out = resample(&input, 16_000, 48_000).unwrap();
            assert_eq!(out.len(), len * 3);
        }
    }

    #[test]
    fn test_downsample_picks_every_nth() {
        let input: Vec<i16> = (0..10).collect();
        assert_eq!(resample(&input, 48_000, 16_000).unwrap(), vec![0, 3, 6]);
    }

    #[test]
    fn test_upsample_duplicates() {
        assert_eq!(
            resample(&[1, -2], 24_000, 48_000).unwrap(),
            vec![1, 1, -2, -2]
        );
    }

    #[test]
    fn test_identity_and_unsupported() {
        assert_eq!(resample(&[5, 6], 48_000, 48_000).unwrap(), vec![5, 6]);
        assert!(matches!(
            resample(&[0; 10], 48_000, 44_100),
            Err(MediaError::UnsupportedRatio { from: 48_000, to: 44_100 })
        ));
        assert!(resample(&[0; 10], 0, 16_000).is_err());
    }

    #[test]
    fn test_split_frames_pads_tail() {
        let input = vec![1i16; FRAME_SAMPLES + 10];
        let frames = split_frames(&input);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].iter().all(|&s| s == 1));
        assert!(frames[1][..10].iter().all(|&s| s == 1));
        assert!(frames[1][10..].iter().all(|&s| s == 0));
        assert!(split_frames(&[]).is_empty());
    }

    #[test]
    fn test_opus_encode_decode_frame() {
        let mut encoder = OpusEncoder::new(64_000).unwrap();
        let mut decoder = OpusDecoder::new().unwrap();

        let frame = [0i16; FRAME_SAMPLES];
        let payload = encoder.encode_frame(&frame).unwrap();
        assert!(!payload.is_empty());

        let pcm = decoder.decode_frame(&payload).unwrap();
        assert_eq!(pcm.len(), FRAME_SAMPLES);
    }

    #[test]
    fn test_encoder_rejects_partial_frame() {
        let mut encoder = OpusEncoder::new(64_000).unwrap();
        assert!(matches!(
            encoder.encode_frame(&[0i16; 100]),
            Err(MediaError::Codec(_))
        ));
    }

    #[test]
    fn test_decoder_rejects_empty_payload() {
        let mut decoder = OpusDecoder::new().unwrap();
        assert!(decoder.decode_frame(&[]).is_err());
    }

    #[test]
    fn test_silence_frame_decodes() {
        let mut decoder = OpusDecoder::new().unwrap();
        let pcm = decoder.decode_frame(&OPUS_SILENCE_FRAME).unwrap();
        assert_eq!(pcm.len(), FRAME_SAMPLES);
    }
}
