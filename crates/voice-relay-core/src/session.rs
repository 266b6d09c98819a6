//! Session model: ids, lifecycle states, and summaries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Opaque identifier of one browser peer session.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a session.
///
/// ```text
/// New -> Negotiating -> Connected -> Active -> Closed
/// ```
///
/// `Closed` is reachable from every state and is terminal. Audio is only
/// handed to the upstream endpoint once the session is `Active`, which in
/// turn requires the peer connection to have reached `Connected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    New,
    Negotiating,
    Connected,
    Active,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (New, Negotiating)
                | (Negotiating, Connected)
                | (Connected, Active)
                | (New | Negotiating | Connected | Active, Closed)
        )
    }

    /// Validate and return the next state.
    pub fn transition(self, next: SessionState) -> Result<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(RelayError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

/// Point-in-time summary of a session, used by status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub provider: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let s = SessionState::New;
        let s = s.transition(SessionState::Negotiating).unwrap();
        let s = s.transition(SessionState::Connected).unwrap();
        let s = s.transition(SessionState::Active).unwrap();
        let s = s.transition(SessionState::Closed).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn test_cannot_skip_connected() {
        assert!(SessionState::Negotiating
            .transition(SessionState::Active)
            .is_err());
        assert!(SessionState::New.transition(SessionState::Active).is_err());
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in [
            SessionState::New,
            SessionState::Negotiating,
            SessionState::Connected,
            SessionState::Active,
            SessionState::Closed,
        ] {
            assert!(!SessionState::Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_session_ids_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Negotiating).unwrap();
        assert_eq!(json, "\"negotiating\"");
    }
}
