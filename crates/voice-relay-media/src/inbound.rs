//! Inbound pipeline: browser RTP to batched upstream PCM.
//!
//! Each packet is deframed and decoded to 48 kHz PCM, which accumulates in a
//! [`PcmBatcher`]. Every time a full batch is available it is resampled to the
//! upstream's rate and handed to a [`ChunkSink`]. Per-packet failures are
//! logged and skipped; the loop only ends on track end, idle timeout, or
//! cancellation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::track::track_remote::TrackRemote;

use crate::codec::{FrameDecoder, WIRE_SAMPLE_RATE, resample};
use crate::error::{MediaError, Result};
use crate::pcm::PcmChunk;
use crate::rtp::deframe;

/// Source of inbound RTP packets (the browser's audio track).
#[async_trait]
pub trait PacketSource: Send + Sync {
    async fn next_packet(&self) -> Result<Packet>;
}

#[async_trait]
impl PacketSource for TrackRemote {
    async fn next_packet(&self) -> Result<Packet> {
        self.read_rtp()
            .await
            .map(|(packet, _attributes)| packet)
            .map_err(|e| MediaError::TrackEnded(e.to_string()))
    }
}

/// Destination for batched PCM (the upstream connector).
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send_chunk(&self, chunk: PcmChunk) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Receiving,
    /// The track ended or returned an error.
    Ended,
    /// No packet arrived within the idle deadline.
    TimedOut,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::TimedOut | Self::Cancelled)
    }
}

/// Accumulates PCM and releases it in fixed-size batches.
///
/// Batches are always exactly `threshold` samples; any excess stays buffered,
/// in order, for the next batch.
#[derive(Debug)]
pub struct PcmBatcher {
    buffer: Vec<i16>,
    threshold: usize,
}

impl PcmBatcher {
    pub fn new(threshold: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(threshold * 2),
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append samples and return every batch that became complete.
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.buffer.extend_from_slice(samples);
        let mut batches = Vec::new();
        while self.buffer.len() >= self.threshold {
            let rest = self.buffer.split_off(self.threshold);
            batches.push(std::mem::replace(&mut self.buffer, rest));
        }
        batches
    }
}

#[derive(Debug, Clone)]
pub struct InboundConfig {
    /// Sample rate the upstream expects.
    pub target_rate: u32,
    /// Batch size in samples at the 48 kHz wire rate.
    pub batch_samples: usize,
    pub idle_timeout: Duration,
}

impl InboundConfig {
    pub fn new(target_rate: u32, batch_ms: u32, idle_timeout: Duration) -> Self {
        Self {
            target_rate,
            batch_samples: (WIRE_SAMPLE_RATE as usize * batch_ms as usize) / 1000,
            idle_timeout,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundStats {
    pub packets: u64,
    pub skipped_packets: u64,
    pub decode_errors: u64,
    pub chunks_sent: u64,
    pub send_errors: u64,
    pub state: PipelineState,
}

pub struct InboundPipeline<D: FrameDecoder> {
    decoder: D,
    batcher: PcmBatcher,
    config: InboundConfig,
    stats: InboundStats,
}

impl<D: FrameDecoder> InboundPipeline<D> {
    pub fn new(decoder: D, config: InboundConfig) -> Self {
        Self {
            decoder,
            batcher: PcmBatcher::new(config.batch_samples),
            config,
            stats: InboundStats::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.stats.state
    }

    pub fn stats(&self) -> &InboundStats {
        &self.stats
    }

    /// Deframe, decode, and batch one RTP packet.
    pub async fn ingest_packet(&mut self, packet: &Packet, sink: &dyn ChunkSink) {
        self.stats.packets += 1;

        let payload = match deframe(packet) {
            Ok(p) => p,
            Err(e) => {
                self.stats.skipped_packets += 1;
                debug!(error = %e, "Skipping RTP packet");
                return;
            }
        };

        let pcm = match self.decoder.decode_frame(&payload) {
            Ok(pcm) => pcm,
            Err(e) => {
                self.stats.decode_errors += 1;
                debug!(error = %e, seq = packet.header.sequence_number, "Skipping undecodable frame");
                return;
            }
        };

        self.ingest_pcm(&pcm, sink).await;
    }

    /// Batch already-decoded 48 kHz PCM and forward any complete batches.
    pub async fn ingest_pcm(&mut self, pcm: &[i16], sink: &dyn ChunkSink) {
        for batch in self.batcher.push(pcm) {
            let samples = match resample(&batch, WIRE_SAMPLE_RATE, self.config.target_rate) {
                Ok(s) => s,
                Err(e) => {
                    self.stats.send_errors += 1;
                    warn!(error = %e, "Dropping batch that cannot be resampled");
                    continue;
                }
            };
            let chunk = PcmChunk::new(samples, self.config.target_rate);
            match sink.send_chunk(chunk).await {
                Ok(()) => self.stats.chunks_sent += 1,
                Err(e) => {
                    self.stats.send_errors += 1;
                    warn!(error = %e, "Failed to forward audio chunk upstream");
                }
            }
        }
    }

    /// Read packets until the track ends, goes idle, or `cancel` fires.
    pub async fn run<S>(
        mut self,
        source: &S,
        sink: &dyn ChunkSink,
        cancel: CancellationToken,
    ) -> InboundStats
    where
        S: PacketSource + ?Sized,
    {
        self.stats.state = PipelineState::Receiving;
        info!(
            target_rate = self.config.target_rate,
            batch_samples = self.batcher.threshold(),
            "Inbound pipeline started"
        );

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    self.stats.state = PipelineState::Cancelled;
                    break;
                }
                next = tokio::time::timeout(self.config.idle_timeout, source.next_packet()) => next,
            };

            match next {
                Ok(Ok(packet)) => self.ingest_packet(&packet, sink).await,
                Ok(Err(e)) => {
                    info!(reason = %e, "Inbound track ended");
                    self.stats.state = PipelineState::Ended;
                    break;
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.idle_timeout.as_millis() as u64,
                        "No inbound RTP within idle deadline"
                    );
                    self.stats.state = PipelineState::TimedOut;
                    break;
                }
            }
        }

        info!(
            state = ?self.stats.state,
            packets = self.stats.packets,
            chunks = self.stats.chunks_sent,
            "Inbound pipeline stopped"
        );
        self.stats
    }
}
