//! Whisper-compatible batch transcription.
//!
//! Each chunk becomes one WAV upload to an `/inference` (whisper.cpp server) or
//! `/v1/audio/transcriptions` style endpoint. Nothing is played back; results
//! surface as final transcripts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voice_relay_core::config::UpstreamConfig;
use voice_relay_media::PcmChunk;
use voice_relay_media::wav::pcm_to_wav;

use crate::error::{ProtocolError, Result, UpstreamError};
use crate::{
    ConnectorState, InputFormat, StateCell, UpstreamEvent, UpstreamEventHandler, UpstreamLink,
    UpstreamProvider,
};

pub const DEFAULT_URL: &str = "http://127.0.0.1:8080/inference";

/// Where and how to post audio.
#[derive(Debug, Clone)]
pub struct WhisperEndpoint {
    pub url: String,
    api_key: Option<String>,
    /// Only sent when explicitly configured; whisper.cpp ignores it.
    pub model: Option<String>,
    pub temperature: f32,
    pub response_format: String,
}

impl WhisperEndpoint {
    pub fn from_config(config: &UpstreamConfig, api_key: Option<String>) -> Self {
        Self {
            url: config.base_url.clone().unwrap_or_else(|| DEFAULT_URL.into()),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            response_format: config.response_format.clone(),
        }
    }

    /// POST one WAV file and return the transcribed text.
    pub async fn transcribe_wav(&self, client: &reqwest::Client, wav: Vec<u8>) -> Result<String> {
        debug!(url = %self.url, wav_bytes = wav.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("chunk.wav")
            .mime_str("audio/wav")?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("temperature", self.temperature.to_string())
            .text("response_format", self.response_format.clone());
        if let Some(model) = &self.model {
            form = form.text("model", model.clone());
        }

        let mut request = client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Http(format!("{status}: {body}")));
        }

        let body = resp.text().await?;
        Ok(parse_transcription(&body, &self.response_format)?)
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: Option<String>,
}

/// Extract the text from a response body in the requested format.
pub fn parse_transcription(body: &str, response_format: &str) -> std::result::Result<String, ProtocolError> {
    if response_format == "text" {
        return Ok(body.trim().to_string());
    }
    let parsed: TranscriptionResponse =
        serde_json::from_str(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    parsed
        .text
        .map(|t| t.trim().to_string())
        .ok_or(ProtocolError::MissingField("text"))
}

pub struct WhisperBatch {
    endpoint: WhisperEndpoint,
    client: reqwest::Client,
    input: InputFormat,
}

impl WhisperBatch {
    pub fn new(config: &UpstreamConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            endpoint: WhisperEndpoint::from_config(config, api_key),
            client,
            input: InputFormat {
                sample_rate: config.input_rate(),
                batch_ms: config.batch_ms(),
            },
        })
    }

    pub fn endpoint(&self) -> &WhisperEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl UpstreamProvider for WhisperBatch {
    fn id(&self) -> &str {
        "whisper"
    }

    fn input_format(&self) -> InputFormat {
        self.input
    }

    fn is_duplex(&self) -> bool {
        false
    }

    async fn connect(
        &self,
        handler: Arc<dyn UpstreamEventHandler>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn UpstreamLink>> {
        info!(url = %self.endpoint.url, "Batch transcription ready");
        Ok(Arc::new(WhisperLink {
            endpoint: Arc::new(self.endpoint.clone()),
            client: self.client.clone(),
            handler,
            state: StateCell::new(ConnectorState::Ready),
            cancel,
        }))
    }
}

/// Fire-and-forget uploads. Requests may overlap, so transcripts can arrive
/// out of order when the endpoint is slower than the batch interval.
pub struct WhisperLink {
    endpoint: Arc<WhisperEndpoint>,
    client: reqwest::Client,
    handler: Arc<dyn UpstreamEventHandler>,
    state: StateCell,
    cancel: CancellationToken,
}

#[async_trait]
impl UpstreamLink for WhisperLink {
    fn state(&self) -> ConnectorState {
        if self.cancel.is_cancelled() {
            return self.state.set(ConnectorState::Closed);
        }
        self.state.get()
    }

    async fn send_audio(&self, chunk: PcmChunk) -> Result<()> {
        let state = self.state();
        if state != ConnectorState::Ready {
            return Err(UpstreamError::NotReady(state));
        }

        let wav = pcm_to_wav(&chunk.samples, chunk.sample_rate, 1, 16);
        let duration = Duration::from_millis(chunk.duration_ms());
        let endpoint = self.endpoint.clone();
        let client = self.client.clone();
        let handler = self.handler.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = endpoint.transcribe_wav(&client, wav) => result,
            };
            match result {
                Ok(text) if text.is_empty() => debug!(?duration, "Empty transcription"),
                Ok(text) => {
                    handler
                        .on_event(UpstreamEvent::Transcript {
                            text,
                            is_final: true,
                        })
                        .await
                }
                Err(e) => {
                    warn!(error = %e, "Transcription request failed");
                    handler.on_event(UpstreamEvent::Error(e.to_string())).await;
                }
            }
        });
        Ok(())
    }

    async fn close(&self) {
        self.state.set(ConnectorState::Closed);
        self.cancel.cancel();
    }
}
