//! Outbound pipeline: upstream synthesized audio to RTP on the browser's track.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::codec::{FrameEncoder, OPUS_SILENCE_FRAME, WIRE_SAMPLE_RATE, resample, split_frames};
use crate::error::{MediaError, Result};
use crate::pcm::{ResponseAudio, decode_base64_pcm};
use crate::rtp::RtpFramer;

/// Destination for outbound RTP packets.
#[async_trait]
pub trait RtpSink: Send + Sync {
    async fn send_packet(&self, packet: &Packet) -> Result<()>;
}

#[async_trait]
impl RtpSink for TrackLocalStaticRTP {
    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        TrackLocalWriter::write_rtp(self, packet)
            .await
            .map(|_| ())
            .map_err(|e| MediaError::Sink(e.to_string()))
    }
}

#[async_trait]
impl<T: RtpSink + ?Sized> RtpSink for Arc<T> {
    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        (**self).send_packet(packet).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayStats {
    pub packets: usize,
    pub encode_failures: usize,
}

pub struct OutboundPipeline<E: FrameEncoder, S: RtpSink> {
    encoder: E,
    framer: RtpFramer,
    sink: S,
    totals: PlayStats,
}

impl<E: FrameEncoder, S: RtpSink> OutboundPipeline<E, S> {
    pub fn new(encoder: E, framer: RtpFramer, sink: S) -> Self {
        Self {
            encoder,
            framer,
            sink,
            totals: PlayStats::default(),
        }
    }

    pub fn framer(&self) -> &RtpFramer {
        &self.framer
    }

    /// Packets and encode failures across the pipeline's lifetime.
    pub fn totals(&self) -> PlayStats {
        self.totals
    }

    /// Decode one upstream audio message and stream it as RTP.
    pub async fn play(&mut self, audio: &ResponseAudio) -> Result<PlayStats> {
        let samples = decode_base64_pcm(&audio.data)?;
        self.play_pcm(&samples, audio.sample_rate).await
    }

    /// Resample to 48 kHz, cut into 20 ms frames, encode, and send each frame.
    ///
    /// A frame that fails to encode goes out as Opus silence so the sequence
    /// and timestamp still advance. A sink error stops this message.
    pub async fn play_pcm(&mut self, samples: &[i16], sample_rate: u32) -> Result<PlayStats> {
        let wire = resample(samples, sample_rate, WIRE_SAMPLE_RATE)?;
        let mut stats = PlayStats::default();

        for frame in split_frames(&wire) {
            let payload = match self.encoder.encode_frame(&frame) {
                Ok(p) => Bytes::from(p),
                Err(e) => {
                    stats.encode_failures += 1;
                    debug!(error = %e, seq = self.framer.next_sequence(), "Encode failed, sending silence");
                    Bytes::from_static(&OPUS_SILENCE_FRAME)
                }
            };

            let packet = self.framer.frame(payload);
            if let Err(e) = self.sink.send_packet(&packet).await {
                warn!(error = %e, seq = packet.header.sequence_number, "Failed to write RTP packet");
                self.record(stats);
                return Err(e);
            }
            stats.packets += 1;
        }

        self.record(stats);
        Ok(stats)
    }

    fn record(&mut self, stats: PlayStats) {
        self.totals.packets += stats.packets;
        self.totals.encode_failures += stats.encode_failures;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::codec::{FRAME_SAMPLES, OpusEncoder};
    use crate::pcm::encode_base64_pcm;

    #[derive(Default)]
    struct CapturingSink {
        packets: Mutex<Vec<Packet>>,
    }

    #[async_trait]
    impl RtpSink for CapturingSink {
        async fn send_packet(&self, packet: &Packet) -> Result<()> {
            self.packets.lock().unwrap().push(packet.clone());
            Ok(())
        }
    }

    struct ClosedSink;

    #[async_trait]
    impl RtpSink for ClosedSink {
        async fn send_packet(&self, _packet: &Packet) -> Result<()> {
            Err(MediaError::Sink("track closed".into()))
        }
    }

    /// Fails every `n`-th encode.
    struct FlakyEncoder {
        calls: usize,
        fail_every: usize,
    }

    impl FrameEncoder for FlakyEncoder {
        fn encode_frame(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
            assert_eq!(pcm.len(), FRAME_SAMPLES);
            self.calls += 1;
            if self.calls % self.fail_every == 0 {
                Err(MediaError::Codec("boom".into()))
            } else {
                Ok(vec![0xaa; 10])
            }
        }
    }

    #[tokio::test]
    async fn test_960_samples_at_24k_yield_two_packets() {
        let sink = Arc::new(CapturingSink::default());
        let encoder = OpusEncoder::new(64_000).unwrap();
        let framer = RtpFramer::with_start(111, 1234, 100, 5000);
        let mut pipeline = OutboundPipeline::new(encoder, framer, sink.clone());

        let audio = ResponseAudio {
            data: encode_base64_pcm(&vec![0i16; 960]),
            sample_rate: 24_000,
        };
        let stats = pipeline.play(&audio).await.unwrap();
        assert_eq!(stats.packets, 2);

        let packets = sink.packets.lock().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].header.sequence_number, 100);
        assert_eq!(packets[1].header.sequence_number, 101);
        assert_eq!(packets[1].header.timestamp - packets[0].header.timestamp, 960);
        assert!(packets.iter().all(|p| !p.payload.is_empty()));
    }

    #[tokio::test]
    async fn test_counters_contiguous_despite_encode_failures() {
        let sink = Arc::new(CapturingSink::default());
        let encoder = FlakyEncoder {
            calls: 0,
            fail_every: 3,
        };
        let start_seq = u16::MAX - 2;
        let start_ts = u32::MAX - 960;
        let framer = RtpFramer::with_start(111, 1, start_seq, start_ts);
        let mut pipeline = OutboundPipeline::new(encoder, framer, sink.clone());

        let frames = 7usize;
        let stats = pipeline
            .play_pcm(&vec![0i16; frames * FRAME_SAMPLES], 48_000)
            .await
            .unwrap();
        assert_eq!(stats.packets, frames);
        assert_eq!(stats.encode_failures, 2);

        let packets = sink.packets.lock().unwrap();
        for (k, p) in packets.iter().enumerate() {
            assert_eq!(p.header.sequence_number, start_seq.wrapping_add(k as u16));
            assert_eq!(p.header.timestamp, start_ts.wrapping_add(960 * k as u32));
        }
        assert_eq!(packets[2].payload.as_ref(), &OPUS_SILENCE_FRAME);
        assert_eq!(pipeline.framer().next_sequence(), start_seq.wrapping_add(7));
    }

    #[tokio::test]
    async fn test_partial_frame_is_padded() {
        let sink = Arc::new(CapturingSink::default());
        let encoder = FlakyEncoder {
            calls: 0,
            fail_every: usize::MAX,
        };
        let mut pipeline =
            OutboundPipeline::new(encoder, RtpFramer::with_start(111, 1, 0, 0), sink.clone());
        let stats = pipeline.play_pcm(&[1i16; 100], 48_000).await.unwrap();
        assert_eq!(stats.packets, 1);
    }

    #[tokio::test]
    async fn test_sink_error_stops_message() {
        let encoder = FlakyEncoder {
            calls: 0,
            fail_every: usize::MAX,
        };
        let mut pipeline =
            OutboundPipeline::new(encoder, RtpFramer::with_start(111, 1, 0, 0), ClosedSink);
        let result = pipeline.play_pcm(&vec![0i16; 4 * FRAME_SAMPLES], 48_000).await;
        assert!(matches!(result, Err(MediaError::Sink(_))));
        // The failed frame still consumed its slot.
        assert_eq!(pipeline.framer().next_sequence(), 1);
    }

    #[tokio::test]
    async fn test_bad_transport_encoding_rejected() {
        let encoder = FlakyEncoder {
            calls: 0,
            fail_every: usize::MAX,
        };
        let mut pipeline = OutboundPipeline::new(
            encoder,
            RtpFramer::with_start(111, 1, 0, 0),
            Arc::new(CapturingSink::default()),
        );
        let audio = ResponseAudio {
            data: "%%%".into(),
            sample_rate: 24_000,
        };
        assert!(matches!(
            pipeline.play(&audio).await,
            Err(MediaError::Transport(_))
        ));
        assert_eq!(pipeline.totals(), PlayStats::default());
    }
}
