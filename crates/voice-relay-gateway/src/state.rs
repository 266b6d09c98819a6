//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use webrtc::api::API;

use voice_relay_core::config::Config;
use voice_relay_core::error::Result;
use voice_relay_core::session::{SessionId, SessionSummary};
use voice_relay_upstream::UpstreamProvider;

use crate::rtc::build_api;
use crate::session::Session;

/// Shared gateway state accessible from all handlers and session callbacks.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub provider: Arc<dyn UpstreamProvider>,
    pub api: API,
    pub sessions: SessionRegistry,
    pub started_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(config: Config, provider: Arc<dyn UpstreamProvider>) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            provider,
            api: build_api()?,
            sessions: SessionRegistry::default(),
            started_at: Utc::now(),
        })
    }

    /// Close every session. Used on shutdown.
    pub async fn close_all(&self) {
        for session in self.sessions.drain().await {
            session.close().await;
        }
    }
}

/// Live sessions keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub async fn insert(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .insert(session.id().clone(), session);
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    /// The most recently created session.
    pub async fn newest(&self) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .max_by_key(|s| s.created_at())
            .cloned()
    }

    /// Remove the oldest sessions until fewer than `max` remain, and return
    /// them for closing. The lock is released before the caller closes them.
    pub async fn make_room(&self, max: usize) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        evict_oldest(&mut sessions, max)
    }

    /// Insert `session`, evicting the oldest sessions under the same lock so
    /// concurrent inserts never leave more than `max` registered. Returns the
    /// evicted sessions for closing.
    pub async fn insert_bounded(&self, session: Arc<Session>, max: usize) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let evicted = evict_oldest(&mut sessions, max);
        sessions.insert(session.id().clone(), session);
        evicted
    }

    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.summary())
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }
}

fn evict_oldest(sessions: &mut HashMap<SessionId, Arc<Session>>, max: usize) -> Vec<Arc<Session>> {
    let mut evicted = Vec::new();
    while !sessions.is_empty() && sessions.len() >= max {
        let Some(oldest) = sessions
            .values()
            .min_by_key(|s| s.created_at())
            .map(|s| s.id().clone())
        else {
            break;
        };
        if let Some(session) = sessions.remove(&oldest) {
            evicted.push(session);
        }
    }
    evicted
}
