//! Axum-based signaling server.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use voice_relay_core::error::RelayError;
use voice_relay_core::session::SessionId;

use crate::session::Session;
use crate::state::GatewayState;

/// Start the signaling server and block until Ctrl+C, then close all sessions.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr();
    let app = router(state.clone())?;

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(provider = state.provider.id(), "Gateway listening on {addr}");
    if state.config.ui_enabled() {
        info!("Test harness available at http://{bind_addr}:{port}/");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.close_all().await;
    info!("Gateway stopped");
    Ok(())
}

/// Build the application router.
pub fn router(state: Arc<GatewayState>) -> anyhow::Result<Router> {
    let ui_enabled = state.config.ui_enabled();

    // API routes are registered first so they take priority over the UI catch-all.
    #[allow(unused_mut)]
    let mut api = Router::new()
        .route("/webrtc-offer", post(offer_handler))
        .route("/ice-candidate", post(ice_candidate_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "prometheus")]
    {
        let handle = crate::metrics::install_prometheus_recorder()?;
        api = api.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    let mut app = api.with_state(state);
    if ui_enabled {
        app = app.merge(voice_relay_web::ui_router());
    }

    Ok(app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    ))
}

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub offer: RTCSessionDescription,
}

#[derive(Debug, Serialize)]
pub struct OfferResponse {
    pub answer: RTCSessionDescription,
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct IceCandidateRequest {
    #[serde(default)]
    pub candidate: Option<RTCIceCandidateInit>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

async fn offer_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<OfferRequest>, JsonRejection>,
) -> Result<Json<OfferResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    for evicted in state.sessions.make_room(state.config.max_sessions()).await {
        info!(session_id = %evicted.id(), "Replacing existing session");
        evicted.close().await;
    }

    let (session, answer) = Session::create(&state, request.offer).await?;
    let session_id = session.id().clone();
    // Another offer may have been registered while this one negotiated.
    for evicted in state.sessions.insert_bounded(session, state.config.max_sessions()).await {
        info!(session_id = %evicted.id(), "Replacing existing session");
        evicted.close().await;
    }

    info!(session_id = %session_id, "Answered offer");
    Ok(Json(OfferResponse { answer, session_id }))
}

async fn ice_candidate_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<IceCandidateRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let success = Json(json!({ "success": true }));

    let Some(candidate) = request.candidate else {
        return Ok(success);
    };

    let session = match &request.session_id {
        Some(id) => state.sessions.get(id).await,
        None => state.sessions.newest().await,
    };
    let Some(session) = session else {
        warn!(session_id = ?request.session_id, "ICE candidate for unknown session");
        return Ok(success);
    };

    if let Err(e) = session.add_ice_candidate(candidate).await {
        warn!(session_id = %session.id(), error = %e, "Failed to apply ICE candidate");
    }
    Ok(success)
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let summaries = state.sessions.summaries().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": summaries.len(),
        "session_details": summaries,
        "provider": state.provider.id(),
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
    }))
}

/// Handler error mapped to an HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Signaling(_) | RelayError::Json(_) => Self::BadRequest(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(message) => {
                error!(error = %message, "Request failed");
                crate::metrics::record_error("signaling");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status() {
        let bad: ApiError = RelayError::Signaling("expected an offer".into()).into();
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);

        let internal: ApiError = RelayError::Session("ICE failed".into()).into();
        assert_eq!(
            internal.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_ice_request_shapes() {
        let full: IceCandidateRequest = serde_json::from_value(json!({
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            },
            "session_id": "abc"
        }))
        .unwrap();
        assert_eq!(full.session_id, Some(SessionId::from("abc")));
        assert_eq!(full.candidate.unwrap().sdp_mline_index, Some(0));

        let end_of_candidates: IceCandidateRequest =
            serde_json::from_value(json!({ "candidate": null })).unwrap();
        assert!(end_of_candidates.candidate.is_none());
    }
}
