//! Chat endpoints: Ollama `/api/chat` and the OpenAI pass-through paths.
//!
//! All three routes forward to the upstream `/v1/chat/completions`
//! surface. `/api/chat` resolves friendly aliases and may speak Ollama
//! NDJSON back to the client; the `/v1` paths keep the OpenAI schema
//! whatever wire format was negotiated.

use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::TryStreamExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::encode::{Encoder, Schema, WireFormat};
use crate::models::ErrorBody;
use crate::server::ProxyState;
use crate::stream::{non_streaming_chunks, transform_sse_stream};

const NON_STREAMING_TIMEOUT: Duration = Duration::from_secs(120);

/// Accept header sent upstream on streaming requests.
const UPSTREAM_ACCEPT: &str = "text/event-stream, application/json";

// ── POST /api/chat ─────────────────────────────────────────────────────

pub(crate) async fn api_chat(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut body: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            error!("invalid /api/chat request body: {e}");
            return bad_request(format!("Invalid JSON body: {e}"));
        }
    };

    if let Some(model) = body.get("model").and_then(Value::as_str) {
        let resolved = state.aliases.resolve(model);
        if resolved != model {
            debug!(alias = %model, id = %resolved, "resolved model alias");
        }
        body["model"] = Value::String(resolved);
    }

    prepare_chat_body(&mut body);
    info!("proxying /api/chat -> /v1/chat/completions");

    if wants_stream(&body) {
        streaming_chat(&state, &headers, body, "/v1/chat/completions", false).await
    } else {
        non_streaming_chat(&state, &body, "/v1/chat/completions").await
    }
}

// ── POST /v1/chat/completions, /chat/completions ───────────────────────

pub(crate) async fn openai_chat(
    State(state): State<ProxyState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut body: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            error!("invalid {} request body: {e}", uri.path());
            return bad_request(format!("Invalid JSON body: {e}"));
        }
    };

    prepare_chat_body(&mut body);
    info!(path = %uri.path(), "proxying chat completion");

    // The request path is preserved upstream; the schema stays OpenAI
    // even for NDJSON clients.
    if wants_stream(&body) {
        streaming_chat(&state, &headers, body, uri.path(), true).await
    } else {
        non_streaming_chat(&state, &body, uri.path()).await
    }
}

// ── Streaming path ─────────────────────────────────────────────────────

async fn streaming_chat(
    state: &ProxyState,
    headers: &HeaderMap,
    body: Value,
    upstream_path: &str,
    force_openai: bool,
) -> Response {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let wire = WireFormat::from_accept(accept);
    let schema = if force_openai || wire == WireFormat::Sse {
        Schema::OpenAi
    } else {
        Schema::Ollama
    };
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let encoder = Encoder::new(wire, schema, model);
    let inject = state.config.thinking_mode.injects_reasoning();
    debug!(?wire, ?schema, inject, "negotiated streaming encoding");

    let guard = state.streams.start();

    let url = format!("{}{}", state.config.upstream, upstream_path);
    let upstream = state
        .client
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, UPSTREAM_ACCEPT)
        .json(&body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            // Guard drops here; the counter releases before the error
            // response leaves.
            error!("upstream request error for {upstream_path}: {e}");
            return upstream_error(&e);
        }
    };

    let is_sse = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    if is_sse {
        let bytes = upstream.bytes_stream().map_err(std::io::Error::other);
        let transformed = transform_sse_stream(bytes, encoder, inject, Some(guard));
        streaming_response(wire, Body::from_stream(transformed))
    } else {
        // Upstream answered with a complete JSON body despite the
        // streaming request; emit its single representation.
        let raw = match upstream.bytes().await {
            Ok(b) => b,
            Err(e) => {
                error!("failed to read upstream response: {e}");
                return upstream_error(&e);
            }
        };
        let chunks = non_streaming_chunks(&raw, &encoder, inject);
        streaming_response(wire, Body::from(chunks.concat()))
    }
}

fn streaming_response(wire: WireFormat, body: Body) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, wire.content_type())
        .header(header::VARY, "Accept");

    if wire == WireFormat::Sse {
        builder = builder
            .header(header::CACHE_CONTROL, "no-cache")
            .header("x-accel-buffering", "no")
            .header(header::CONNECTION, "keep-alive");
    }

    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ── Non-streaming path ─────────────────────────────────────────────────

/// Plain JSON forward: no heartbeats, no transformation.
async fn non_streaming_chat(state: &ProxyState, body: &Value, upstream_path: &str) -> Response {
    let url = format!("{}{}", state.config.upstream, upstream_path);
    debug!(%url, "non-streaming chat forward");

    let sent = state
        .client
        .post(&url)
        .timeout(NON_STREAMING_TIMEOUT)
        .header(header::CONTENT_TYPE, "application/json")
        .json(body)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status);

    let upstream = match sent {
        Ok(resp) => resp,
        Err(e) => {
            error!("upstream request error for {upstream_path}: {e}");
            return upstream_error(&e);
        }
    };

    let status = upstream.status();
    match upstream.bytes().await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => {
            error!("failed to read upstream response: {e}");
            upstream_error(&e)
        }
    }
}

// ── Shared helpers ─────────────────────────────────────────────────────

/// Strict streaming-flag interpretation: only explicit true-like values
/// count. `"false"`, absent, or anything unrecognized means no stream.
pub fn wants_stream(body: &Value) -> bool {
    match body.get("stream") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
        }
        _ => false,
    }
}

/// Advisory logging pass over an outbound chat body.
fn prepare_chat_body(body: &mut Value) {
    let estimated = estimate_tokens(body.get("messages"));
    if estimated > 2000 {
        warn!(
            estimated_tokens = estimated,
            "large prompt detected; upstream may time out"
        );
    }

    if let Some(tools) = body.get_mut("tools").and_then(Value::as_array_mut) {
        info!(tools = tools.len(), "tool request detected");
        patch_tools(tools);
    }
}

/// Patch point for upstream tool-schema quirks. Currently pass-through.
fn patch_tools(_tools: &mut [Value]) {}

/// Rough token estimate: total string length across message fields / 4.
/// Advisory only; never alters the request.
fn estimate_tokens(messages: Option<&Value>) -> usize {
    let Some(messages) = messages.and_then(Value::as_array) else {
        return 0;
    };
    let chars: usize = messages
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|m| m.values())
        .filter_map(Value::as_str)
        .map(str::len)
        .sum();
    chars / 4
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody::bad_request(message))).into_response()
}

fn upstream_error(e: &reqwest::Error) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorBody::upstream_connection_error(e.to_string())),
    )
        .into_response()
}
