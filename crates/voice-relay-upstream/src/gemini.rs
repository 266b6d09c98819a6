//! Gemini Live bidirectional audio.
//!
//! Auth is via API key in the query string. After `setup` the server answers
//! `setupComplete`; synthesized speech arrives as base64 PCM inline data in
//! `serverContent.modelTurn.parts`.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use voice_relay_core::config::UpstreamConfig;
use voice_relay_media::pcm::rate_from_mime;
use voice_relay_media::{PcmChunk, ResponseAudio};

use crate::duplex::{DuplexConnector, DuplexProtocol, DuplexTimeouts, url_with_query};
use crate::error::{ProtocolError, Result, UpstreamError};
use crate::{InputFormat, UpstreamEvent};

const DEFAULT_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Gemini emits 24 kHz PCM unless the mime type says otherwise.
const DEFAULT_OUTPUT_RATE: u32 = 24_000;

pub struct GeminiLive {
    pub url: String,
    api_key: String,
    model: String,
    voice: Option<String>,
    instructions: Option<String>,
    input_rate: u32,
}

impl GeminiLive {
    pub fn new(
        base_url: Option<&str>,
        api_key: String,
        model: &str,
        input_rate: u32,
    ) -> Self {
        Self {
            url: base_url
                .unwrap_or(DEFAULT_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            voice: None,
            instructions: None,
            input_rate,
        }
    }

    pub fn with_voice(mut self, voice: Option<String>) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = instructions;
        self
    }

    fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

/// Build the Gemini Live connector from config.
pub fn gemini_live(config: &UpstreamConfig, api_key: String) -> DuplexConnector<GeminiLive> {
    let protocol = GeminiLive::new(
        config.base_url.as_deref(),
        api_key,
        config.model(),
        config.input_rate(),
    )
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

// --- Client messages ---

#[derive(Debug, Serialize)]
struct SetupMessage {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

// --- Server messages ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    tool_call: Option<serde_json::Value>,
    #[serde(default)]
    tool_call_cancellation: Option<serde_json::Value>,
    #[serde(default)]
    go_away: Option<serde_json::Value>,
    #[serde(default)]
    usage_metadata: Option<serde_json::Value>,
    #[serde(default)]
    session_resumption_update: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    inline_data: Option<InlineData>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: Option<String>,
}

fn content_events(content: ServerContent) -> std::result::Result<Vec<UpstreamEvent>, ProtocolError> {
    let mut events = Vec::new();

    if content.interrupted {
        events.push(UpstreamEvent::Interrupted);
    }

    for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
        if let Some(inline) = part.inline_data {
            let mime = inline.mime_type.unwrap_or_default();
            if !mime.is_empty() && !mime.starts_with("audio/") {
                events.push(UpstreamEvent::Ignored(format!("inlineData {mime}")));
                continue;
            }
            let data = inline
                .data
                .ok_or(ProtocolError::MissingField("inlineData.data"))?;
            events.push(UpstreamEvent::Audio(ResponseAudio {
                data,
                sample_rate: rate_from_mime(&mime).unwrap_or(DEFAULT_OUTPUT_RATE),
            }));
        } else if let Some(text) = part.text {
            events.push(UpstreamEvent::Transcript {
                text,
                is_final: false,
            });
        }
    }

    if let Some(text) = content.output_transcription.and_then(|t| t.text) {
        events.push(UpstreamEvent::Transcript {
            text,
            is_final: false,
        });
    }

    if content.turn_complete {
        events.push(UpstreamEvent::TurnComplete);
    }

    if events.is_empty() {
        events.push(UpstreamEvent::Ignored("serverContent".into()));
    }
    Ok(events)
}

impl DuplexProtocol for GeminiLive {
    fn id(&self) -> &'static str {
        "gemini"
    }

    fn request(&self) -> Result<Request> {
        url_with_query(&self.url, "key", &self.api_key)?
            .into_client_request()
            .map_err(|e| UpstreamError::Connect(format!("invalid Gemini URL: {e}")))
    }

    fn setup_message(&self) -> serde_json::Value {
        let speech_config = self.voice.as_ref().map(|voice| {
            serde_json::json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            })
        });
        let message = SetupMessage {
            setup: Setup {
                model: self.model_path(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO"],
                    speech_config,
                },
                system_instruction: self.instructions.as_ref().map(|text| Content {
                    parts: vec![TextPart { text: text.clone() }],
                }),
            },
        };
        serde_json::to_value(message).unwrap_or_default()
    }

    fn encode_audio(&self, chunk: &PcmChunk) -> serde_json::Value {
        let message = RealtimeInputMessage {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: format!("audio/pcm;rate={}", self.input_rate),
                    data: chunk.to_base64(),
                }],
            },
        };
        serde_json::to_value(message).unwrap_or_default()
    }

    fn parse_events(&self, raw: &[u8]) -> std::result::Result<Vec<UpstreamEvent>, ProtocolError> {
        let msg: ServerMessage =
            serde_json::from_slice(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        if msg.setup_complete.is_some() {
            return Ok(vec![UpstreamEvent::SetupComplete]);
        }
        if let Some(content) = msg.server_content {
            return content_events(content);
        }
        if msg.go_away.is_some() {
            return Ok(vec![UpstreamEvent::GoAway]);
        }
        if msg.tool_call.is_some() || msg.tool_call_cancellation.is_some() {
            return Ok(vec![UpstreamEvent::Ignored("toolCall".into())]);
        }
        if msg.usage_metadata.is_some() || msg.session_resumption_update.is_some() {
            return Ok(vec![UpstreamEvent::Ignored("metadata".into())]);
        }

        let keys = serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(raw)
            .map(|m| m.keys().cloned().collect::<Vec<_>>().join(","))
            .unwrap_or_default();
        Err(ProtocolError::Unrecognized(format!("keys [{keys}]")))
    }
}
