//! Media pipeline: Opus codec adapter, RTP framing, inbound batching, outbound playback.
//!
//! Inbound: RTP packet -> Opus payload -> 48 kHz PCM -> batched chunk at the
//! upstream rate. Outbound: base64 PCM from the upstream -> 48 kHz -> 960-sample
//! Opus frames -> RTP packets on the session's outbound track.

pub mod codec;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod pcm;
pub mod rtp;
pub mod wav;

pub use error::MediaError;
pub use pcm::{PcmChunk, ResponseAudio};
