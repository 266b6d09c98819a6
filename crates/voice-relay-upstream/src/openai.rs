//! OpenAI Realtime over WebSocket.

use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use voice_relay_core::config::UpstreamConfig;
use voice_relay_media::{PcmChunk, ResponseAudio};

use crate::duplex::{DuplexConnector, DuplexProtocol, DuplexTimeouts, url_with_query};
use crate::error::{ProtocolError, Result, UpstreamError};
use crate::{InputFormat, UpstreamEvent};

const DEFAULT_URL: &str = "wss://api.openai.com/v1/realtime";
const DEFAULT_VOICE: &str = "alloy";
const DEFAULT_INSTRUCTIONS: &str = "You are helpful. Answer briefly in ENGLISH only.";

/// Realtime PCM16 is always 24 kHz mono.
const OUTPUT_RATE: u32 = 24_000;

/// Lifecycle events that carry nothing the relay acts on.
const IGNORED: &[&str] = &[
    "session.created",
    "conversation.created",
    "conversation.item.created",
    "conversation.item.truncated",
    "conversation.item.input_audio_transcription.completed",
    "conversation.item.input_audio_transcription.delta",
    "input_audio_buffer.committed",
    "input_audio_buffer.cleared",
    "rate_limits.updated",
    "response.created",
    "response.output_item.added",
    "response.output_item.done",
    "response.content_part.added",
    "response.content_part.done",
    "response.audio.done",
    "response.output_audio.done",
    "response.audio_transcript.done",
    "response.output_audio_transcript.done",
    "response.text.delta",
    "response.text.done",
];

pub struct OpenAiRealtime {
    pub url: String,
    api_key: String,
    model: String,
    voice: String,
    instructions: String,
}

impl OpenAiRealtime {
    pub fn new(base_url: Option<&str>, api_key: String, model: &str) -> Self {
        Self {
            url: base_url
                .unwrap_or(DEFAULT_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            voice: DEFAULT_VOICE.into(),
            instructions: DEFAULT_INSTRUCTIONS.into(),
        }
    }

    pub fn with_voice(mut self, voice: Option<String>) -> Self {
        if let Some(voice) = voice {
            self.voice = voice;
        }
        self
    }

    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        if let Some(instructions) = instructions {
            self.instructions = instructions;
        }
        self
    }
}

pub fn openai_realtime(config: &UpstreamConfig, api_key: String) -> DuplexConnector<OpenAiRealtime> {
    let protocol = OpenAiRealtime::new(config.base_url.as_deref(), api_key, config.model())
        .with_voice(config.voice.clone())
        .with_instructions(config.instructions.clone());

    DuplexConnector::new(
        protocol,
        InputFormat {
            sample_rate: config.input_rate(),
            batch_ms: config.batch_ms(),
        },
        DuplexTimeouts::from_config(config),
    )
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta { delta: Option<String> },
    #[serde(
        rename = "response.audio_transcript.delta",
        alias = "response.output_audio_transcript.delta"
    )]
    TranscriptDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<ErrorBody>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventType {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl DuplexProtocol for OpenAiRealtime {
    fn id(&self) -> &'static str {
        "openai"
    }

    fn request(&self) -> Result<Request> {
        let mut request = url_with_query(&self.url, "model", &self.model)?
            .into_client_request()
            .map_err(|e| UpstreamError::Connect(format!("invalid OpenAI URL: {e}")))?;

        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| UpstreamError::Connect(format!("invalid API key: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", auth);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        Ok(request)
    }

    fn setup_message(&self) -> serde_json::Value {
        json!({
            "type": "session.update",
            "session": {
                "modalities": ["audio", "text"],
                "voice": self.voice,
                "instructions": self.instructions,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "turn_detection": { "type": "server_vad" }
            }
        })
    }

    fn encode_audio(&self, chunk: &PcmChunk) -> serde_json::Value {
        json!({
            "type": "input_audio_buffer.append",
            "audio": chunk.to_base64(),
        })
    }

    fn parse_events(&self, raw: &[u8]) -> std::result::Result<Vec<UpstreamEvent>, ProtocolError> {
        let event: ServerEvent =
            serde_json::from_slice(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let event = match event {
            ServerEvent::SessionUpdated => UpstreamEvent::SetupComplete,
            ServerEvent::AudioDelta { delta } => UpstreamEvent::Audio(ResponseAudio {
                data: delta.ok_or(ProtocolError::MissingField("delta"))?,
                sample_rate: OUTPUT_RATE,
            }),
            ServerEvent::TranscriptDelta { delta } => UpstreamEvent::Transcript {
                text: delta,
                is_final: false,
            },
            ServerEvent::SpeechStarted => UpstreamEvent::SpeechStarted,
            ServerEvent::SpeechStopped => UpstreamEvent::SpeechStopped,
            ServerEvent::ResponseDone => UpstreamEvent::TurnComplete,
            ServerEvent::Error { error } => UpstreamEvent::Error(
                error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "unknown error".into()),
            ),
            ServerEvent::Other => {
                let kind = serde_json::from_slice::<EventType>(raw)
                    .ok()
                    .and_then(|t| t.kind)
                    .unwrap_or_default();
                if IGNORED.contains(&kind.as_str()) {
                    UpstreamEvent::Ignored(kind)
                } else {
                    return Err(ProtocolError::Unrecognized(kind));
                }
            }
        };
        Ok(vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> OpenAiRealtime {
        OpenAiRealtime::new(None, "sk-test".into(), "gpt-4o-mini-realtime-preview")
    }

    #[test]
    fn test_request_headers() {
        let request = protocol().request().unwrap();
        assert_eq!(
            request.uri().to_string(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-mini-realtime-preview"
        );
        assert_eq!(request.headers()["Authorization"], "Bearer sk-test");
        assert_eq!(request.headers()["OpenAI-Beta"], "realtime=v1");
    }

    #[test]
    fn test_setup_defaults_and_overrides() {
        let setup = protocol().setup_message();
        assert_eq!(setup["type"], "session.update");
        assert_eq!(setup["session"]["voice"], "alloy");
        assert_eq!(setup["session"]["input_audio_format"], "pcm16");
        assert_eq!(setup["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(setup["session"]["instructions"], DEFAULT_INSTRUCTIONS);

        let custom = protocol()
            .with_voice(Some("verse".into()))
            .with_instructions(Some("Speak German.".into()))
            .setup_message();
        assert_eq!(custom["session"]["voice"], "verse");
        assert_eq!(custom["session"]["instructions"], "Speak German.");
    }

    #[test]
    fn test_encode_audio() {
        let msg = protocol().encode_audio(&PcmChunk::new(vec![1], 24_000));
        assert_eq!(msg["type"], "input_audio_buffer.append");
        assert_eq!(msg["audio"], "AQA=");
    }

    #[test]
    fn test_parse_known_events() {
        let p = protocol();
        assert_eq!(
            p.parse_events(br#"{"type":"session.updated","session":{}}"#).unwrap(),
            vec![UpstreamEvent::SetupComplete]
        );
        for kind in ["response.audio.delta", "response.output_audio.delta"] {
            let raw = format!(r#"{{"type":"{kind}","delta":"AAAA","item_id":"x"}}"#);
            assert_eq!(
                p.parse_events(raw.as_bytes()).unwrap(),
                vec![UpstreamEvent::Audio(ResponseAudio {
                    data: "AAAA".into(),
                    sample_rate: 24_000
                })]
            );
        }
        assert_eq!(
            p.parse_events(br#"{"type":"response.audio_transcript.delta","delta":"Hi"}"#)
                .unwrap(),
            vec![UpstreamEvent::Transcript {
                text: "Hi".into(),
                is_final: false
            }]
        );
        assert_eq!(
            p.parse_events(br#"{"type":"input_audio_buffer.speech_started"}"#).unwrap(),
            vec![UpstreamEvent::SpeechStarted]
        );
        assert_eq!(
            p.parse_events(br#"{"type":"response.done","response":{}}"#).unwrap(),
            vec![UpstreamEvent::TurnComplete]
        );
    }

    #[test]
    fn test_parse_error_event() {
        let events = protocol()
            .parse_events(br#"{"type":"error","error":{"message":"bad key"}}"#)
            .unwrap();
        assert_eq!(events, vec![UpstreamEvent::Error("bad key".into())]);
    }

    #[test]
    fn test_audio_delta_without_payload() {
        assert_eq!(
            protocol().parse_events(br#"{"type":"response.audio.delta"}"#),
            Err(ProtocolError::MissingField("delta"))
        );
    }

    #[test]
    fn test_ignored_vs_unrecognized() {
        let p = protocol();
        assert_eq!(
            p.parse_events(br#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap(),
            vec![UpstreamEvent::Ignored("rate_limits.updated".into())]
        );
        assert_eq!(
            p.parse_events(br#"{"type":"brand.new.event"}"#),
            Err(ProtocolError::Unrecognized("brand.new.event".into()))
        );
        assert!(matches!(
            p.parse_events(br#"{"no_type":true}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
