//! Browser test harness served by the gateway.
//!
//! A single page that captures the microphone, negotiates with
//! `/webrtc-offer`, trickles candidates to `/ice-candidate`, and plays the
//! relayed audio. Assets are baked into the binary with `rust-embed`.

use axum::Router;
use axum::extract::Path;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use rust_embed::Embed;

#[derive(Embed)]
#[folder = "ui/"]
struct HarnessAssets;

/// Router serving the harness at `/` and its assets by path.
///
/// Merge this after the signaling routes.
pub fn ui_router() -> Router {
    Router::new()
        .route("/", get(|| async { asset_response("index.html") }))
        .route("/{*path}", get(asset_handler))
}

async fn asset_handler(Path(path): Path<String>) -> Response {
    asset_response(&path)
}

fn asset_response(path: &str) -> Response {
    let Some(asset) = HarnessAssets::get(path) else {
        return (StatusCode::NOT_FOUND, Html("<h1>404</h1>")).into_response();
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime.as_ref())],
        asset.data.into_owned(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_index_served() {
        let resp = ui_router()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/html"
        );
    }

    #[tokio::test]
    async fn test_unknown_asset_is_404() {
        let resp = ui_router()
            .oneshot(Request::get("/nope.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_harness_targets_signaling_routes() {
        let index = HarnessAssets::get("index.html").unwrap();
        let html = std::str::from_utf8(&index.data).unwrap();
        assert!(html.contains("/webrtc-offer"));
        assert!(html.contains("/ice-candidate"));
    }
}
