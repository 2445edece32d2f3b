//! Ollama and OpenAI API data models for the translation layer.
//!
//! Types here match the wire shapes the two dialects exchange; the
//! streaming pipeline itself works on dynamic `serde_json::Value` events
//! because upstream payloads are not under our control.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capabilities always advertised to the client so it enables its
/// chat/agent/embedding feature UIs against this proxy.
pub const FORCED_CAPABILITIES: [&str; 5] =
    ["completion", "chat", "embeddings", "tools", "planAndExecute"];

/// Union of upstream-reported capabilities and [`FORCED_CAPABILITIES`], sorted.
pub fn augment_capabilities<I, S>(existing: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut caps: BTreeSet<String> = existing.into_iter().map(Into::into).collect();
    caps.extend(FORCED_CAPABILITIES.iter().map(|c| (*c).to_owned()));
    caps.into_iter().collect()
}

// =============================================================================
// Error Response Types
// =============================================================================

/// Flat error body: `{"error": "<kind>", "message": "<detail>"}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    /// Upstream connect/timeout failure (served with HTTP 502).
    pub fn upstream_connection_error(detail: impl Into<String>) -> Self {
        Self {
            error: "upstream_connection_error".to_owned(),
            message: detail.into(),
        }
    }

    /// Missing or invalid field in the request body (served with HTTP 400).
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            error: "bad_request".to_owned(),
            message: detail.into(),
        }
    }
}

// =============================================================================
// Version Endpoint
// =============================================================================

/// Response for `/api/version`.
#[derive(Debug, Clone, Serialize)]
pub struct VersionResponse {
    pub status: String,
    pub version: String,
}

// =============================================================================
// Tags / Show Endpoint Types
// =============================================================================

/// Response for `/api/tags`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TagsResponse {
    pub models: Vec<ModelEntry>,
}

/// One model in the `/api/tags` listing.
///
/// `name` is the friendly alias shown to the user; `model` is the real
/// upstream id the alias resolves back to.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub model: String,
    pub modified_at: String,
    pub size: u64,
    pub digest: String,
    pub details: ModelDetails,
    pub capabilities: Vec<String>,
}

/// Ollama model detail block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub parent_model: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub families: Vec<String>,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

fn default_format() -> String {
    "gguf".to_owned()
}

impl Default for ModelDetails {
    fn default() -> Self {
        Self {
            parent_model: String::new(),
            format: default_format(),
            family: String::new(),
            families: Vec::new(),
            parameter_size: String::new(),
            quantization_level: String::new(),
        }
    }
}

/// Response for `/api/show`. The client uses this for feature detection,
/// so it must always materialize with the full capability set.
#[derive(Debug, Clone, Serialize)]
pub struct ShowResponse {
    pub modelfile: String,
    pub parameters: String,
    pub template: String,
    pub details: ModelDetails,
    pub model_info: Value,
    pub capabilities: Vec<String>,
}

impl ShowResponse {
    /// Minimal record built from an upstream `/v1/models/<id>` reply.
    pub fn from_openai_model(info: &Value) -> Self {
        let owned_by = info
            .get("owned_by")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Self {
            modelfile: String::new(),
            parameters: String::new(),
            template: String::new(),
            details: ModelDetails {
                family: owned_by.to_owned(),
                families: if owned_by.is_empty() {
                    Vec::new()
                } else {
                    vec![owned_by.to_owned()]
                },
                ..ModelDetails::default()
            },
            model_info: Value::Object(serde_json::Map::new()),
            capabilities: augment_capabilities(Vec::<String>::new()),
        }
    }
}

// =============================================================================
// Embedding Endpoint Types
// =============================================================================

/// Upstream OpenAI `/v1/embeddings` response, reduced to what the
/// Ollama conversion needs.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiEmbeddingResponse {
    pub data: Vec<OpenAiEmbeddingItem>,
}

/// One embedding vector in an OpenAI embeddings response.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiEmbeddingItem {
    pub embedding: Vec<f32>,
}

// =============================================================================
// Timestamp helpers
// =============================================================================

/// Current time as ISO-8601 UTC.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Normalize an upstream `modified_at`/`created` value into ISO-8601 UTC.
///
/// Numeric values are epoch seconds; strings pass through; anything else
/// (including out-of-range numbers) becomes *now*.
pub fn modified_at_from(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map_or_else(now_rfc3339, |dt| dt.to_rfc3339()),
        _ => now_rfc3339(),
    }
}
