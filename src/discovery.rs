//! Ollama discovery endpoints, adapted from the upstream OpenAI surface.
//!
//! These endpoints exist so the client can enumerate models and
//! feature-detect before chatting. They must stay usable even when the
//! upstream is down: `/api/tags` answers an empty list and `/api/show` a
//! capability stub, both with status 200.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::aliases::{friendly_model_name, register_alias};
use crate::forward::strip_response_headers;
use crate::models::{
    ErrorBody, ModelDetails, ModelEntry, OpenAiEmbeddingResponse, ShowResponse, TagsResponse,
    augment_capabilities, modified_at_from,
};
use crate::server::ProxyState;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);
const EMBED_TIMEOUT: Duration = Duration::from_secs(60);

// ── GET /api/tags ──────────────────────────────────────────────────────

pub(crate) async fn api_tags(State(state): State<ProxyState>) -> Response {
    debug!("GET /api/tags");
    let url = format!("{}/v1/models", state.config.upstream);

    let fetched = async {
        state
            .client
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await
    }
    .await;

    match fetched {
        Ok(data) => {
            let mut aliases = HashMap::new();
            let models = normalize_tags(&data, &mut aliases);
            info!(models = models.len(), "normalized upstream model list");
            state.aliases.publish(aliases);
            Json(TagsResponse { models }).into_response()
        }
        Err(e) => {
            // Discovery never errors out; the client needs a list shape.
            warn!("/api/tags upstream error: {e}");
            Json(TagsResponse::default()).into_response()
        }
    }
}

/// Normalize an upstream model listing — either already Ollama-shaped
/// (`{"models":[...]}`) or OpenAI-shaped (`{"data":[...]}`) — into tags
/// entries, registering a friendly alias for each model id.
fn normalize_tags(data: &Value, aliases: &mut HashMap<String, String>) -> Vec<ModelEntry> {
    if let Some(models) = data.get("models").and_then(Value::as_array) {
        models
            .iter()
            .filter_map(|entry| ollama_tag_entry(entry, aliases))
            .collect()
    } else if let Some(models) = data.get("data").and_then(Value::as_array) {
        models
            .iter()
            .filter_map(|entry| openai_tag_entry(entry, aliases))
            .collect()
    } else {
        Vec::new()
    }
}

fn ollama_tag_entry(entry: &Value, aliases: &mut HashMap<String, String>) -> Option<ModelEntry> {
    let id = ["id", "model", "name"]
        .iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_str))?;

    let alias = friendly_model_name(id);
    register_alias(aliases, &alias, id);

    let details: ModelDetails = entry
        .get("details")
        .cloned()
        .and_then(|d| serde_json::from_value(d).ok())
        .unwrap_or_default();

    Some(ModelEntry {
        name: alias,
        model: id.to_owned(),
        modified_at: modified_at_from(entry.get("modified_at").or_else(|| entry.get("created"))),
        size: entry.get("size").and_then(Value::as_u64).unwrap_or(0),
        digest: entry
            .get("digest")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        details,
        capabilities: augment_capabilities(capability_strings(entry)),
    })
}

fn openai_tag_entry(entry: &Value, aliases: &mut HashMap<String, String>) -> Option<ModelEntry> {
    let id = entry.get("id").and_then(Value::as_str)?;

    let alias = friendly_model_name(id);
    register_alias(aliases, &alias, id);

    Some(ModelEntry {
        name: alias,
        model: id.to_owned(),
        modified_at: modified_at_from(entry.get("created")),
        size: 0,
        digest: String::new(),
        details: ModelDetails::default(),
        capabilities: augment_capabilities(capability_strings(entry)),
    })
}

fn capability_strings(entry: &Value) -> Vec<String> {
    entry
        .get("capabilities")
        .and_then(Value::as_array)
        .map(|caps| {
            caps.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

// ── POST /api/show ─────────────────────────────────────────────────────

pub(crate) async fn api_show(State(state): State<ProxyState>, body: Bytes) -> Response {
    let body: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    let Some(model) = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::bad_request("Missing 'model' in body")),
        )
            .into_response();
    };

    let model = state.aliases.resolve(model);
    debug!(model = %model, "POST /api/show");

    // First choice: the OpenAI-compatible per-model endpoint.
    let url = format!(
        "{}/v1/models/{}",
        state.config.upstream,
        urlencoding::encode(&model)
    );
    match state.client.get(&url).timeout(DISCOVERY_TIMEOUT).send().await {
        Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
            if let Ok(info) = resp.json::<Value>().await {
                return Json(ShowResponse::from_openai_model(&info)).into_response();
            }
        }
        Ok(resp) => debug!(status = %resp.status(), "/v1/models/<id> lookup failed"),
        Err(e) => debug!("/v1/models/<id> lookup error: {e}"),
    }

    // Second choice: the upstream may itself speak Ollama.
    if let Some(response) = native_show_fallback(&state, &model).await {
        return response;
    }

    // Last resort: a stub with the capability set so feature detection
    // still succeeds.
    Json(json!({
        "details": {"format": "gguf", "family": "", "families": []},
        "capabilities": augment_capabilities(Vec::<String>::new()),
    }))
    .into_response()
}

async fn native_show_fallback(state: &ProxyState, model: &str) -> Option<Response> {
    let url = format!("{}/api/show", state.config.upstream);
    let resp = state
        .client
        .post(&url)
        .timeout(DISCOVERY_TIMEOUT)
        .json(&json!({"model": model}))
        .send()
        .await
        .ok()?;

    if resp.status() != reqwest::StatusCode::OK {
        return None;
    }

    let headers = resp.headers().clone();
    let raw = resp.bytes().await.ok()?;

    match serde_json::from_slice::<Value>(&raw) {
        Ok(mut obj) if obj.is_object() => {
            inject_capabilities(&mut obj);
            Some(Json(obj).into_response())
        }
        // Not a JSON object: forward verbatim, hop-by-hop headers dropped.
        _ => Some(raw_upstream_response(StatusCode::OK, &headers, raw)),
    }
}

/// Merge the forced capability set into an arbitrary JSON object.
fn inject_capabilities(obj: &mut Value) {
    let merged = augment_capabilities(capability_strings(obj));
    obj["capabilities"] = json!(merged);
}

// ── POST /api/embed, /api/embeddings ───────────────────────────────────

pub(crate) async fn api_embed(State(state): State<ProxyState>, body: Bytes) -> Response {
    let mut body: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));

    if let Some(model) = body.get("model").and_then(Value::as_str) {
        let resolved = state.aliases.resolve(model);
        if resolved != model {
            debug!(alias = %model, id = %resolved, "resolved model alias");
        }
        body["model"] = Value::String(resolved);
    }

    info!("proxying /api/embed -> /v1/embeddings");
    let url = format!("{}/v1/embeddings", state.config.upstream);

    let upstream = match state
        .client
        .post(&url)
        .timeout(EMBED_TIMEOUT)
        .header(header::CONTENT_TYPE, "application/json")
        .json(&body)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            error!("/api/embed upstream error: {e}");
            return (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody::upstream_connection_error(e.to_string())),
            )
                .into_response();
        }
    };

    let status = upstream.status();
    let headers = upstream.headers().clone();
    let raw = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            error!("failed to read upstream embedding response: {e}");
            return (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody::upstream_connection_error(e.to_string())),
            )
                .into_response();
        }
    };

    // Convert the OpenAI shape into Ollama's; anything unexpected is
    // forwarded untouched so the client sees the upstream's own error.
    match serde_json::from_slice::<OpenAiEmbeddingResponse>(&raw) {
        Ok(parsed) => {
            let mut data = parsed.data;
            if data.len() == 1 {
                let embedding = data.remove(0).embedding;
                Json(json!({"embedding": embedding})).into_response()
            } else {
                let embeddings: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
                if embeddings.is_empty() {
                    Json(json!({"embedding": []})).into_response()
                } else {
                    Json(json!({"embeddings": embeddings})).into_response()
                }
            }
        }
        Err(_) => raw_upstream_response(
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            &headers,
            raw,
        ),
    }
}

// ── Shared ─────────────────────────────────────────────────────────────

/// Forward raw upstream bytes, keeping status and headers except the
/// hop-by-hop set.
fn raw_upstream_response(
    status: StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: Bytes,
) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in strip_response_headers(headers) {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
