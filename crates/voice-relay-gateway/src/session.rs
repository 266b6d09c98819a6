//! One browser peer and its relay: peer connection, outbound track, upstream
//! link, and the tasks that move audio between them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use voice_relay_core::error::{RelayError, Result};
use voice_relay_core::session::{SessionId, SessionState, SessionSummary};
use voice_relay_media::codec::{OpusDecoder, OpusEncoder};
use voice_relay_media::inbound::{ChunkSink, InboundConfig, InboundPipeline};
use voice_relay_media::outbound::OutboundPipeline;
use voice_relay_media::rtp::RtpFramer;
use voice_relay_media::{MediaError, PcmChunk};
use voice_relay_upstream::{UpstreamEvent, UpstreamEventHandler, UpstreamLink, UpstreamProvider};

use crate::metrics;
use crate::rtc::{outbound_audio_track, rtc_configuration};
use crate::state::GatewayState;

type Outbound = OutboundPipeline<OpusEncoder, Arc<TrackLocalStaticRTP>>;

pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    pc: Arc<RTCPeerConnection>,
    slot: Arc<UpstreamSlot>,
    outbound: tokio::sync::Mutex<Outbound>,
    provider: Arc<dyn UpstreamProvider>,
    gateway: Weak<GatewayState>,
    cancel: CancellationToken,
    upstream_started: AtomicBool,
    track_idle_timeout: Duration,
}

impl Session {
    /// Negotiate a new session from a browser offer and return it with the
    /// local answer. The caller registers the session.
    pub async fn create(
        gateway: &Arc<GatewayState>,
        offer: RTCSessionDescription,
    ) -> Result<(Arc<Self>, RTCSessionDescription)> {
        if offer.sdp_type != RTCSdpType::Offer {
            return Err(RelayError::Signaling(format!(
                "expected an offer, got {}",
                offer.sdp_type
            )));
        }

        let session = Self::open(gateway).await?;
        let gathering_timeout = gateway.config.webrtc().gathering_timeout();
        match session.negotiate(offer, gathering_timeout).await {
            Ok(answer) => Ok((session, answer)),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Negotiation failed");
                session.close().await;
                Err(e)
            }
        }
    }

    /// Build the peer connection with the outbound track attached and all
    /// callbacks registered. No SDP has been exchanged yet.
    pub async fn open(gateway: &Arc<GatewayState>) -> Result<Arc<Self>> {
        let id = SessionId::new();
        let media = gateway.config.media();

        let pc = gateway
            .api
            .new_peer_connection(rtc_configuration(&gateway.config.webrtc()))
            .await
            .map(Arc::new)
            .map_err(|e| RelayError::Session(format!("creating peer connection: {e}")))?;

        // The outbound track must be in place before the answer is created.
        let track = outbound_audio_track(id.as_str());
        let encoder = OpusEncoder::new(media.opus_bitrate).map_err(|e| RelayError::Media(e.to_string()));
        let sender = pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RelayError::Session(format!("adding outbound track: {e}")));
        let (encoder, sender) = match (encoder, sender) {
            (Ok(encoder), Ok(sender)) => (encoder, sender),
            (Err(e), _) | (_, Err(e)) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };

        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let ssrc = media.ssrc.unwrap_or_else(rand::random);
        let framer = RtpFramer::new(media.payload_type, ssrc);

        let session = Arc::new(Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(SessionState::New),
            pc,
            slot: Arc::new(UpstreamSlot::new()),
            outbound: tokio::sync::Mutex::new(OutboundPipeline::new(encoder, framer, track)),
            provider: gateway.provider.clone(),
            gateway: Arc::downgrade(gateway),
            cancel: CancellationToken::new(),
            upstream_started: AtomicBool::new(false),
            track_idle_timeout: media.track_idle_timeout(),
        });
        session.register_callbacks();
        metrics::record_session_open();

        info!(session_id = %session.id, provider = session.provider.id(), ssrc, "Session opened");
        Ok(session)
    }

    fn register_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |pc_state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    info!(session_id = %session.id, state = %pc_state, "Peer connection state changed");
                    match pc_state {
                        RTCPeerConnectionState::Connected => {
                            tokio::spawn(async move {
                                if let Err(e) = session.clone().on_connected().await {
                                    debug!(session_id = %session.id, error = %e, "Upstream not started");
                                }
                            });
                        }
                        RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed => {
                            tokio::spawn(async move { session.close().await });
                        }
                        _ => {}
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    debug!(kind = %track.kind(), "Ignoring non-audio track");
                    return;
                }
                if let Some(session) = weak.upgrade() {
                    tokio::spawn(session.run_inbound(track));
                }
            })
        }));
    }

    async fn negotiate(
        &self,
        offer: RTCSessionDescription,
        gathering_timeout: Duration,
    ) -> Result<RTCSessionDescription> {
        self.transition(SessionState::Negotiating)?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| RelayError::Session(format!("setting remote description: {e}")))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| RelayError::Session(format!("creating answer: {e}")))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| RelayError::Session(format!("setting local description: {e}")))?;

        if tokio::time::timeout(gathering_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(session_id = %self.id, ?gathering_timeout, "ICE gathering incomplete, answering with partial candidates");
        }

        self.pc
            .local_description()
            .await
            .ok_or_else(|| RelayError::Session("no local description after negotiation".into()))
    }

    async fn on_connected(self: Arc<Self>) -> Result<()> {
        self.transition(SessionState::Connected)?;
        self.start_upstream().await
    }

    /// Connect the upstream link and start forwarding audio. Requires the
    /// peer to be `Connected`; runs at most once per session; a failed
    /// handshake closes the session.
    pub async fn start_upstream(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        if !state.can_transition_to(SessionState::Active) {
            if self.upstream_started.load(Ordering::SeqCst) {
                debug!(session_id = %self.id, "Upstream already started");
                return Ok(());
            }
            return Err(RelayError::InvalidTransition {
                from: state,
                to: SessionState::Active,
            });
        }
        if self.upstream_started.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.id, "Upstream already started");
            return Ok(());
        }

        let handler: Arc<dyn UpstreamEventHandler> = Arc::new(SessionResponder {
            session: Arc::downgrade(self),
        });
        let link = match self.provider.connect(handler, self.cancel.child_token()).await {
            Ok(link) => link,
            Err(e) => {
                error!(session_id = %self.id, provider = self.provider.id(), error = %e, "Upstream handshake failed, closing session");
                metrics::record_error("upstream_connect");
                self.close().await;
                return Err(RelayError::Upstream(e.to_string()));
            }
        };

        if let Err(e) = self.transition(SessionState::Active) {
            link.close().await;
            return Err(e);
        }
        self.slot.attach(link);

        // Closed between the transition and the attach.
        if self.cancel.is_cancelled() {
            if let Some(link) = self.slot.detach() {
                link.close().await;
            }
            return Ok(());
        }

        info!(session_id = %self.id, provider = self.provider.id(), "Session active");
        Ok(())
    }

    async fn run_inbound(self: Arc<Self>, track: Arc<TrackRemote>) {
        let decoder = match OpusDecoder::new() {
            Ok(d) => d,
            Err(e) => {
                error!(session_id = %self.id, error = %e, "Cannot decode inbound audio");
                metrics::record_error("codec");
                return;
            }
        };

        let input = self.provider.input_format();
        let config = InboundConfig::new(input.sample_rate, input.batch_ms, self.track_idle_timeout);
        info!(session_id = %self.id, ssrc = track.ssrc(), "Inbound audio track started");

        let stats = InboundPipeline::new(decoder, config)
            .run(track.as_ref(), self.slot.as_ref(), self.cancel.child_token())
            .await;

        metrics::record_rtp_packets("inbound", stats.packets);
        info!(
            session_id = %self.id,
            state = ?stats.state,
            packets = stats.packets,
            chunks = stats.chunks_sent,
            decode_errors = stats.decode_errors,
            dropped_before_ready = self.slot.dropped(),
            "Inbound audio track finished"
        );
    }

    async fn handle_upstream_event(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Audio(audio) => {
                let mut outbound = self.outbound.lock().await;
                match outbound.play(&audio).await {
                    Ok(stats) => {
                        metrics::record_rtp_packets("outbound", stats.packets as u64);
                        if stats.encode_failures > 0 {
                            metrics::record_error("encode");
                            warn!(session_id = %self.id, failures = stats.encode_failures, "Sent silence for frames that failed to encode");
                        }
                    }
                    Err(e) => {
                        metrics::record_error("playback");
                        warn!(session_id = %self.id, error = %e, "Dropped upstream audio");
                    }
                }
            }
            UpstreamEvent::Transcript { text, is_final } => {
                info!(session_id = %self.id, is_final, text = %text, "Transcript");
            }
            UpstreamEvent::Error(message) => {
                metrics::record_error("upstream");
                error!(session_id = %self.id, provider = self.provider.id(), %message, "Upstream reported an error");
            }
            UpstreamEvent::GoAway => {
                warn!(session_id = %self.id, "Upstream is about to disconnect");
            }
            UpstreamEvent::Interrupted => {
                debug!(session_id = %self.id, "Upstream response interrupted");
            }
            UpstreamEvent::Ignored(kind) => trace!(session_id = %self.id, kind, "Ignored upstream message"),
            other => debug!(session_id = %self.id, event = ?other, "Upstream event"),
        }
    }

    /// Apply a remote ICE candidate. Empty candidates are accepted and ignored.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if candidate.candidate.is_empty() {
            return Ok(());
        }
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| RelayError::Signaling(format!("adding ICE candidate: {e}")))
    }

    /// Stop every task, close the upstream link and the peer connection, and
    /// leave the registry. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.is_terminal() {
                return;
            }
            *state = SessionState::Closed;
        }

        self.cancel.cancel();
        if let Some(link) = self.slot.detach() {
            link.close().await;
        }
        if let Err(e) = self.pc.close().await {
            warn!(session_id = %self.id, error = %e, "Error closing peer connection");
        }
        if let Some(gateway) = self.gateway.upgrade() {
            gateway.sessions.remove(&self.id).await;
        }

        metrics::record_session_closed();
        let packets = self.outbound.lock().await.totals().packets;
        info!(session_id = %self.id, outbound_packets = packets, "Session closed");
    }

    pub(crate) fn transition(&self, next: SessionState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = state.transition(next)?;
        Ok(())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn slot(&self) -> &UpstreamSlot {
        &self.slot
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            state: self.state(),
            provider: self.provider.id().to_string(),
            created_at: self.created_at,
        }
    }
}

/// Routes upstream events back into the session that opened the link.
struct SessionResponder {
    session: Weak<Session>,
}

#[async_trait]
impl UpstreamEventHandler for SessionResponder {
    async fn on_event(&self, event: UpstreamEvent) {
        if let Some(session) = self.session.upgrade() {
            session.handle_upstream_event(event).await;
        }
    }
}

/// Hand-off point between the inbound pipeline and the upstream link.
///
/// Empty until the session is active. Chunks offered while empty are dropped,
/// so no audio reaches the endpoint before the peer is connected and the
/// handshake has completed.
pub struct UpstreamSlot {
    link: RwLock<Option<Arc<dyn UpstreamLink>>>,
    dropped: AtomicU64,
}

impl UpstreamSlot {
    pub fn new() -> Self {
        Self {
            link: RwLock::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn attach(&self, link: Arc<dyn UpstreamLink>) {
        *self.link.write().unwrap_or_else(|e| e.into_inner()) = Some(link);
    }

    pub fn detach(&self) -> Option<Arc<dyn UpstreamLink>> {
        self.link.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_attached(&self) -> bool {
        self.link.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Chunks dropped because no link was attached.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn current(&self) -> Option<Arc<dyn UpstreamLink>> {
        self.link.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for UpstreamSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkSink for UpstreamSlot {
    async fn send_chunk(&self, chunk: PcmChunk) -> voice_relay_media::error::Result<()> {
        let Some(link) = self.current() else {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(dropped, samples = chunk.samples.len(), "Upstream not ready, dropping chunk");
            return Ok(());
        };
        link.send_audio(chunk)
            .await
            .map_err(|e| MediaError::Sink(e.to_string()))?;
        metrics::record_upstream_chunk();
        Ok(())
    }
}
