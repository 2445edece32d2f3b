//! Axum HTTP server: shared state and route assembly.
//!
//! The proxy serves the Ollama surface (`/api/*`), the OpenAI chat
//! pass-through (`/v1/chat/completions`, `/chat/completions`), a debug
//! helper, and a generic fallback proxy for everything else.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    response::IntoResponse,
    routing::{get, post},
};
use bytes::Bytes;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::aliases::AliasTable;
use crate::config::Config;
use crate::models::VersionResponse;
use crate::stream::StreamTracker;
use crate::{chat, discovery, forward};

/// Shared proxy state — cloneable, injected via Axum `State`.
#[derive(Clone)]
pub struct ProxyState {
    pub client: Client,
    pub config: Arc<Config>,
    pub aliases: Arc<AliasTable>,
    pub streams: Arc<StreamTracker>,
}

impl ProxyState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
            aliases: Arc::new(AliasTable::new()),
            streams: StreamTracker::new(),
        })
    }
}

/// Build the full route tree.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/api/version", get(api_version))
        .route("/api/tags", get(discovery::api_tags))
        .route("/api/show", post(discovery::api_show))
        .route("/api/chat", post(chat::api_chat))
        .route("/api/embed", post(discovery::api_embed))
        .route("/api/embeddings", post(discovery::api_embed))
        .route("/v1/chat/completions", post(chat::openai_chat))
        .route("/chat/completions", post(chat::openai_chat))
        .route("/debug/json", post(debug_json))
        .fallback(forward::passthrough)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the proxy server with a pre-bound listener; runs until the
/// cancellation token fires.
pub async fn serve(
    listener: TcpListener,
    state: ProxyState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("proxy listening on {addr}");
    info!("Ollama-compatible: http://{addr}/api");
    info!("OpenAI-compatible: http://{addr}/v1");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("proxy server shut down");
    Ok(())
}

// ── GET/HEAD /api/version ──────────────────────────────────────────────

/// Liveness probe; some clients issue HEAD, which axum serves from the
/// GET route.
async fn api_version() -> impl IntoResponse {
    Json(VersionResponse {
        status: "ok".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
    })
}

// ── POST /debug/json ───────────────────────────────────────────────────

/// Echo the request body back minified, for inspecting what a client
/// actually sends.
async fn debug_json(body: Bytes) -> impl IntoResponse {
    let value: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    Json(json!({"minified": value.to_string()}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThinkingMode;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> ProxyState {
        ProxyState::new(Config {
            listen_host: "127.0.0.1".to_owned(),
            listen_port: 0,
            upstream: "http://127.0.0.1:9".to_owned(),
            thinking_mode: ThinkingMode::Default,
            thinking_debug: false,
            verbose: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn version_reports_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/version")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn debug_json_minifies_body() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/debug/json")
                    .header("content-type", "application/json")
                    .body(Body::from("{ \"a\" : 1, \"b\" : [ 2, 3 ] }"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["minified"], "{\"a\":1,\"b\":[2,3]}");
    }

    #[tokio::test]
    async fn debug_json_tolerates_invalid_body() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/debug/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["minified"], "{}");
    }

    #[tokio::test]
    async fn chat_rejects_invalid_json() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from("{broken"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "bad_request");
    }

    #[tokio::test]
    async fn show_requires_model_field() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/show")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "bad_request");
        assert_eq!(json["message"], "Missing 'model' in body");
    }

    #[tokio::test]
    async fn tags_returns_empty_list_when_upstream_unreachable() {
        // Upstream points at a closed port; discovery must still 200.
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/tags")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["models"], json!([]));
    }
}
