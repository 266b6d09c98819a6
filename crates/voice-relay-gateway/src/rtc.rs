//! WebRTC API construction shared by all sessions.

use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use voice_relay_core::config::WebRtcConfig;
use voice_relay_core::error::{RelayError, Result};
use voice_relay_media::codec::WIRE_SAMPLE_RATE;

/// Build the API with default codecs and interceptors (NACK, RTCP reports).
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| RelayError::Signaling(format!("registering codecs: {e}")))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| RelayError::Signaling(format!("registering interceptors: {e}")))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub fn rtc_configuration(config: &WebRtcConfig) -> RTCConfiguration {
    let ice_servers = if config.ice_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: config.ice_servers.clone(),
            ..Default::default()
        }]
    };
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

/// The session's outbound Opus track (48 kHz mono, in-band FEC).
pub fn outbound_audio_track(session_id: &str) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: WIRE_SAMPLE_RATE,
            channels: 1,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        "audio".to_owned(),
        format!("voice-relay-{session_id}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::track::track_local::TrackLocal;

    #[test]
    fn test_rtc_configuration_ice_servers() {
        let config = rtc_configuration(&WebRtcConfig::default());
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302"]);

        let empty = rtc_configuration(&WebRtcConfig {
            ice_servers: vec![],
            ..WebRtcConfig::default()
        });
        assert!(empty.ice_servers.is_empty());
    }

    #[test]
    fn test_outbound_track_is_opus() {
        let track = outbound_audio_track("abc");
        assert_eq!(track.codec().mime_type, MIME_TYPE_OPUS);
        assert_eq!(track.codec().clock_rate, 48_000);
        assert_eq!(track.stream_id(), "voice-relay-abc");
    }

    #[test]
    fn test_build_api() {
        assert!(build_api().is_ok());
    }
}
