use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unsupported resample ratio: {from} Hz -> {to} Hz")]
    UnsupportedRatio { from: u32, to: u32 },

    #[error("Transport decode error: {0}")]
    Transport(String),

    #[error("Track ended: {0}")]
    TrackEnded(String),

    #[error("Sink error: {0}")]
    Sink(String),
}

pub type Result<T> = std::result::Result<T, MediaError>;
