use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Media error: {0}")]
    Media(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_error_names_both_states() {
        let err = SessionState::Negotiating
            .transition(SessionState::Active)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid session transition: Negotiating -> Active"
        );
    }

    #[test]
    fn test_json_errors_convert() {
        let err: RelayError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, RelayError::Json(_)));
    }
}
