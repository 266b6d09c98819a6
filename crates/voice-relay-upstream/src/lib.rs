//! Upstream speech endpoint abstraction.
//!
//! Each endpoint implements [`UpstreamProvider`]. A provider is built once from
//! config and opens one [`UpstreamLink`] per browser session. Duplex providers
//! (Gemini Live, OpenAI Realtime) hold a WebSocket and push synthesized audio
//! back through an [`UpstreamEventHandler`]; the batch provider (Whisper) posts
//! each chunk over HTTP and reports transcripts.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use voice_relay_core::config::{ProviderKind, UpstreamConfig};
use voice_relay_media::{PcmChunk, ResponseAudio};

pub mod duplex;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod whisper;

pub use error::{ProtocolError, Result, UpstreamError};

/// What the inbound pipeline must produce for this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub batch_ms: u32,
}

/// Something the endpoint told us.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    SetupComplete,
    Audio(ResponseAudio),
    Transcript { text: String, is_final: bool },
    SpeechStarted,
    SpeechStopped,
    TurnComplete,
    Interrupted,
    GoAway,
    Error(String),
    /// A recognized message we deliberately do nothing with.
    Ignored(String),
}

/// Receives events from a link's receive loop.
///
/// The loop awaits each call before reading the next message, so audio for
/// one message is fully drained before the next arrives.
#[async_trait]
pub trait UpstreamEventHandler: Send + Sync {
    async fn on_event(&self, event: UpstreamEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    Connecting,
    Ready,
    Failed,
    Closed,
}

impl ConnectorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Shared, monotonic connector state. Terminal states never change.
#[derive(Debug)]
pub struct StateCell(Mutex<ConnectorState>);

impl StateCell {
    pub fn new(state: ConnectorState) -> Self {
        Self(Mutex::new(state))
    }

    pub fn get(&self) -> ConnectorState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` unless already terminal. Returns the resulting state.
    pub fn set(&self, next: ConnectorState) -> ConnectorState {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.is_terminal() {
            *guard = next;
        }
        *guard
    }
}

/// An open connection to the endpoint for one session.
#[async_trait]
pub trait UpstreamLink: Send + Sync {
    fn state(&self) -> ConnectorState;

    /// Forward one chunk. Does not wait for any response.
    async fn send_audio(&self, chunk: PcmChunk) -> Result<()>;

    /// Stop the receive loop and release the connection. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Provider identifier (e.g., "gemini", "openai").
    fn id(&self) -> &str;

    fn input_format(&self) -> InputFormat;

    /// Whether the endpoint sends audio back.
    fn is_duplex(&self) -> bool;

    /// Open a link, completing any setup handshake before returning.
    async fn connect(
        &self,
        handler: Arc<dyn UpstreamEventHandler>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn UpstreamLink>>;
}

/// Build the configured provider. Duplex providers require a credential.
pub fn provider_from_config(config: &UpstreamConfig) -> Result<Arc<dyn UpstreamProvider>> {
    let api_key = config.resolve_api_key();
    if config.provider.is_duplex() && api_key.is_none() {
        return Err(UpstreamError::MissingCredential(config.api_key_source()));
    }

    let provider: Arc<dyn UpstreamProvider> = match (config.provider, api_key) {
        (ProviderKind::Gemini, Some(key)) => Arc::new(gemini::gemini_live(config, key)),
        (ProviderKind::Openai, Some(key)) => Arc::new(openai::openai_realtime(config, key)),
        (ProviderKind::Whisper, key) => Arc::new(whisper::WhisperBatch::new(config, key)?),
        (kind, None) => return Err(UpstreamError::MissingCredential(kind.to_string())),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_terminal_is_sticky() {
        let cell = StateCell::new(ConnectorState::Connecting);
        assert_eq!(cell.set(ConnectorState::Ready), ConnectorState::Ready);
        assert_eq!(cell.set(ConnectorState::Failed), ConnectorState::Failed);
        assert_eq!(cell.set(ConnectorState::Ready), ConnectorState::Failed);
        assert_eq!(cell.set(ConnectorState::Closed), ConnectorState::Failed);
    }

    #[test]
    fn test_duplex_provider_requires_key() {
        let config = UpstreamConfig {
            provider: ProviderKind::Openai,
            api_key_env: Some("NONEXISTENT_VR_UPSTREAM_KEY".into()),
            ..UpstreamConfig::default()
        };
        let err = provider_from_config(&config).err().unwrap();
        assert!(matches!(err, UpstreamError::MissingCredential(ref v) if v == "NONEXISTENT_VR_UPSTREAM_KEY"));
    }

    #[test]
    fn test_provider_selection() {
        let gemini = provider_from_config(&UpstreamConfig {
            api_key: Some("k".into()),
            ..UpstreamConfig::default()
        })
        .unwrap();
        assert_eq!(gemini.id(), "gemini");
        assert!(gemini.is_duplex());
        assert_eq!(
            gemini.input_format(),
            InputFormat {
                sample_rate: 16_000,
                batch_ms: 500
            }
        );

        let openai = provider_from_config(&UpstreamConfig {
            provider: ProviderKind::Openai,
            api_key: Some("k".into()),
            ..UpstreamConfig::default()
        })
        .unwrap();
        assert_eq!(openai.id(), "openai");
        assert_eq!(openai.input_format().sample_rate, 24_000);

        let whisper = provider_from_config(&UpstreamConfig {
            provider: ProviderKind::Whisper,
            ..UpstreamConfig::default()
        })
        .unwrap();
        assert_eq!(whisper.id(), "whisper");
        assert!(!whisper.is_duplex());
        assert_eq!(whisper.input_format().batch_ms, 3_000);
    }
}
