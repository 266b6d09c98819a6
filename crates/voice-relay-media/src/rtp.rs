//! RTP framing for outbound Opus and payload extraction for inbound packets.

use bytes::Bytes;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::util::Unmarshal;

use crate::codec::FRAME_SAMPLES;
use crate::error::{MediaError, Result};

pub const DEFAULT_OPUS_PAYLOAD_TYPE: u8 = 111;

/// Extract the Opus payload from a parsed RTP packet.
pub fn deframe(packet: &Packet) -> Result<Bytes> {
    let mut depacketizer = OpusPacket::default();
    depacketizer
        .depacketize(&packet.payload)
        .map_err(|e| MediaError::Rtp(format!("seq {}: {e}", packet.header.sequence_number)))
}

/// Parse a raw datagram as RTP and extract its Opus payload.
pub fn deframe_raw(raw: &[u8]) -> Result<Bytes> {
    let mut buf = raw;
    let packet = Packet::unmarshal(&mut buf)
        .map_err(|e| MediaError::Rtp(format!("malformed RTP packet: {e}")))?;
    deframe(&packet)
}

/// Stamps outbound Opus frames with a per-session sequence number and timestamp.
///
/// Both counters wrap. They advance once per frame whether or not a payload
/// was produced for it, so the receiver's playback clock stays aligned.
#[derive(Debug, Clone)]
pub struct RtpFramer {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    samples_per_frame: u32,
}

impl RtpFramer {
    /// Random initial sequence number and timestamp.
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self::with_start(payload_type, ssrc, rand::random(), rand::random())
    }

    pub fn with_start(payload_type: u8, ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence,
            timestamp,
            samples_per_frame: FRAME_SAMPLES as u32,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next frame will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp the next frame will carry.
    pub fn next_timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Build the packet for the next frame and advance the counters.
    pub fn frame(&mut self, payload: Bytes) -> Packet {
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: self.payload_type,
                sequence_number: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload,
        };
        self.advance();
        packet
    }

    /// Skip one frame slot without emitting a packet.
    pub fn advance(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::util::Marshal;

    #[test]
    fn test_frame_header_fields() {
        let mut framer = RtpFramer::with_start(111, 1234, 1, 1);
        let packet = framer.frame(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(packet.header.version, 2);
        assert_eq!(packet.header.payload_type, 111);
        assert_eq!(packet.header.ssrc, 1234);
        assert_eq!(packet.header.sequence_number, 1);
        assert_eq!(packet.header.timestamp, 1);
        assert_eq!(framer.next_sequence(), 2);
        assert_eq!(framer.next_timestamp(), 961);
    }

    #[test]
    fn test_counters_wrap() {
        let mut framer = RtpFramer::with_start(111, 1, u16::MAX, u32::MAX - 100);
        let first = framer.frame(Bytes::from_static(&[0]));
        let second = framer.frame(Bytes::from_static(&[0]));
        assert_eq!(first.header.sequence_number, u16::MAX);
        assert_eq!(second.header.sequence_number, 0);
        assert_eq!(second.header.timestamp, (u32::MAX - 100).wrapping_add(960));
    }

    #[test]
    fn test_advance_without_payload_keeps_clock() {
        let mut framer = RtpFramer::with_start(111, 1, 10, 0);
        framer.advance();
        let packet = framer.frame(Bytes::from_static(&[0]));
        assert_eq!(packet.header.sequence_number, 11);
        assert_eq!(packet.header.timestamp, 960);
    }

    #[test]
    fn test_deframe_returns_payload() {
        let mut framer = RtpFramer::with_start(111, 1, 0, 0);
        let packet = framer.frame(Bytes::from_static(&[0xf8, 0xff, 0xfe]));
        let payload = deframe(&packet).unwrap();
        assert!(payload.len() <= packet.payload.len());
        assert_eq!(payload.as_ref(), &[0xf8, 0xff, 0xfe]);
    }

    #[test]
    fn test_deframe_raw_roundtrip_and_bounds() {
        let mut framer = RtpFramer::with_start(111, 99, 5, 5);
        for len in [1usize, 3, 80, 400] {
            let payload = Bytes::from(vec![0xabu8; len]);
            let raw = framer.frame(payload.clone()).marshal().unwrap();
            let out = deframe_raw(&raw).unwrap();
            assert!(out.len() <= payload.len());
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn test_deframe_rejects_empty_payload() {
        let mut framer = RtpFramer::with_start(111, 1, 0, 0);
        let packet = framer.frame(Bytes::new());
        assert!(matches!(deframe(&packet), Err(MediaError::Rtp(_))));
    }

    #[test]
    fn test_deframe_raw_rejects_malformed() {
        assert!(deframe_raw(&[]).is_err());
        assert!(deframe_raw(&[0x80, 111, 0]).is_err());
    }
}
