use thiserror::Error;

use voice_relay_media::MediaError;

use crate::ConnectorState;

/// A message from the endpoint that could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unrecognized message: {0}")]
    Unrecognized(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("cancelled")]
    Cancelled,

    #[error("send failed: {0}")]
    Send(String),

    #[error("link is {0:?}, not accepting audio")]
    NotReady(ConnectorState),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("no credential configured (set {0})")]
    MissingCredential(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout("HTTP request")
        } else {
            Self::Http(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, UpstreamError>;
