//! Output encoding for the negotiated wire format and schema.
//!
//! One upstream event can leave the proxy in three client-visible
//! encodings: `(SSE, OpenAI)`, `(NDJSON, OpenAI)`, or `(NDJSON, Ollama)`.
//! NDJSON lines are always JSON objects; non-object payloads are wrapped
//! in OpenAI schema and dropped in Ollama schema, which strict clients
//! parse as typed message rows.

use serde_json::{Value, json};

use crate::frames::Frame;
use crate::models::now_rfc3339;

/// Client-visible wire format, chosen from the `Accept` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Sse,
    Ndjson,
}

impl WireFormat {
    /// NDJSON only when the client explicitly asks for it; SSE otherwise.
    pub fn from_accept(accept: Option<&str>) -> Self {
        let accept = accept.unwrap_or_default().to_ascii_lowercase();
        if accept.contains("application/x-ndjson") {
            Self::Ndjson
        } else {
            Self::Sse
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Sse => "text/event-stream",
            Self::Ndjson => "application/x-ndjson",
        }
    }
}

/// Event schema spoken to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    OpenAi,
    Ollama,
}

/// Serializes rewritten events for one `(wire, schema)` pair.
#[derive(Debug, Clone)]
pub struct Encoder {
    wire: WireFormat,
    schema: Schema,
    model: String,
}

impl Encoder {
    pub fn new(wire: WireFormat, schema: Schema, model: impl Into<String>) -> Self {
        Self {
            wire,
            schema,
            model: model.into(),
        }
    }

    /// Comment frames emitted before any upstream byte is consumed.
    /// NDJSON clients get nothing until real data arrives.
    pub fn preamble(&self) -> Vec<String> {
        match self.wire {
            WireFormat::Sse => vec![": heartbeat\n\n".to_owned(), ": processing-prompt\n\n".to_owned()],
            WireFormat::Ndjson => Vec::new(),
        }
    }

    /// Encode one parsed (and possibly rewritten) event. `None` means the
    /// event has no representation in this encoding.
    pub fn event(&self, value: &Value) -> Option<String> {
        match (self.wire, self.schema) {
            (WireFormat::Sse, _) => Some(format!("data: {value}\n\n")),
            (WireFormat::Ndjson, Schema::OpenAi) => {
                if value.is_object() {
                    Some(format!("{value}\n"))
                } else {
                    Some(format!("{}\n", json!({"value": value})))
                }
            }
            (WireFormat::Ndjson, Schema::Ollama) => {
                let text = streaming_content(value);
                if text.is_empty() {
                    None
                } else {
                    Some(self.message_line(&text))
                }
            }
        }
    }

    /// Encode a comment/control frame with no `data:` lines.
    pub fn control(&self, frame: &Frame) -> Vec<String> {
        match (self.wire, self.schema) {
            (WireFormat::Sse, _) => vec![frame.raw.clone()],
            (WireFormat::Ndjson, Schema::OpenAi) => frame
                .comments
                .iter()
                .map(|comment| format!("{}\n", json!({"type": "heartbeat", "comment": comment})))
                .collect(),
            (WireFormat::Ndjson, Schema::Ollama) => Vec::new(),
        }
    }

    /// Degraded encoding for a `data:` payload that is not valid JSON.
    pub fn unparsed(&self, frame: &Frame) -> Vec<String> {
        match (self.wire, self.schema) {
            (WireFormat::Sse, _) => vec![frame.raw.clone()],
            (WireFormat::Ndjson, Schema::OpenAi) => {
                let payload = frame.payload.as_deref().unwrap_or_default();
                if payload.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![format!("{}\n", json!({"value": payload}))]
                }
            }
            (WireFormat::Ndjson, Schema::Ollama) => Vec::new(),
        }
    }

    /// Stream terminator for this encoding.
    pub fn done_line(&self) -> String {
        match (self.wire, self.schema) {
            (WireFormat::Sse, _) => "data: [DONE]\n\n".to_owned(),
            (WireFormat::Ndjson, Schema::OpenAi) => format!("{}\n", json!({"done": true})),
            (WireFormat::Ndjson, Schema::Ollama) => {
                format!("{}\n", json!({"model": self.model, "done": true}))
            }
        }
    }

    /// Synthesized delta carrying content buffered ahead of reasoning
    /// that never arrived.
    pub fn buffered_flush(&self, content: &str) -> Option<String> {
        let flush = json!({"choices": [{"delta": {"content": content}}]});
        self.event(&flush)
    }

    /// Emit a complete non-streaming upstream body in this encoding.
    pub fn non_streaming(&self, data: &Value) -> Vec<String> {
        match (self.wire, self.schema) {
            (WireFormat::Sse, _) => vec![format!("data: {data}\n\n")],
            (WireFormat::Ndjson, Schema::OpenAi) => {
                if data.is_object() {
                    vec![format!("{data}\n")]
                } else {
                    vec![format!("{}\n", json!({"value": data}))]
                }
            }
            (WireFormat::Ndjson, Schema::Ollama) => {
                let text = message_content(data);
                let mut lines = Vec::new();
                if !text.is_empty() {
                    lines.push(self.message_line(&text));
                }
                lines.push(self.done_line());
                lines
            }
        }
    }

    /// One Ollama chat chunk row (`done: false`).
    fn message_line(&self, content: &str) -> String {
        let line = json!({
            "model": self.model,
            "created_at": now_rfc3339(),
            "message": {"role": "assistant", "content": content},
            "done": false,
        });
        format!("{line}\n")
    }
}

/// Assistant text of one streaming event: every non-empty `delta.content`
/// across the choices, falling back to `message.content` only when no
/// delta carried anything.
fn streaming_content(value: &Value) -> String {
    let Some(choices) = value.get("choices").and_then(Value::as_array) else {
        return String::new();
    };

    let mut fragments: Vec<&str> = Vec::new();
    for choice in choices {
        if let Some(fragment) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            && !fragment.is_empty()
        {
            fragments.push(fragment);
        }
        if fragments.is_empty()
            && let Some(fragment) = choice
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
            && !fragment.is_empty()
        {
            fragments.push(fragment);
        }
    }
    fragments.concat()
}

/// Assistant text of one non-streaming body: concatenated
/// `message.content` across the choices.
fn message_content(value: &Value) -> String {
    let Some(choices) = value.get("choices").and_then(Value::as_array) else {
        return String::new();
    };

    choices
        .iter()
        .filter_map(|choice| {
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoder(wire: WireFormat, schema: Schema) -> Encoder {
        Encoder::new(wire, schema, "test-model")
    }

    #[test]
    fn wire_format_from_accept() {
        assert_eq!(WireFormat::from_accept(None), WireFormat::Sse);
        assert_eq!(
            WireFormat::from_accept(Some("text/event-stream")),
            WireFormat::Sse
        );
        assert_eq!(
            WireFormat::from_accept(Some("application/x-ndjson")),
            WireFormat::Ndjson
        );
        assert_eq!(
            WireFormat::from_accept(Some("Application/X-NDJSON, text/plain")),
            WireFormat::Ndjson
        );
    }

    #[test]
    fn sse_event_encoding() {
        let enc = encoder(WireFormat::Sse, Schema::OpenAi);
        let event = json!({"choices": [{"delta": {"content": "hi"}}]});
        assert_eq!(
            enc.event(&event).unwrap(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"
        );
        assert_eq!(enc.done_line(), "data: [DONE]\n\n");
    }

    #[test]
    fn ndjson_openai_wraps_non_objects() {
        let enc = encoder(WireFormat::Ndjson, Schema::OpenAi);
        assert_eq!(enc.event(&json!([1, 2])).unwrap(), "{\"value\":[1,2]}\n");
        assert_eq!(enc.event(&json!("text")).unwrap(), "{\"value\":\"text\"}\n");
        assert_eq!(enc.event(&json!({"a": 1})).unwrap(), "{\"a\":1}\n");
        assert_eq!(enc.done_line(), "{\"done\":true}\n");
    }

    #[test]
    fn ndjson_ollama_builds_message_rows() {
        let enc = encoder(WireFormat::Ndjson, Schema::Ollama);
        let event = json!({"choices": [{"delta": {"content": "hi"}}]});
        let line = enc.event(&event).unwrap();
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["model"], "test-model");
        assert_eq!(parsed["message"]["role"], "assistant");
        assert_eq!(parsed["message"]["content"], "hi");
        assert_eq!(parsed["done"], false);
        assert!(parsed["created_at"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn ndjson_ollama_skips_contentless_events() {
        let enc = encoder(WireFormat::Ndjson, Schema::Ollama);
        assert!(enc.event(&json!({"choices": [{"delta": {}}]})).is_none());
        assert!(enc.event(&json!({"usage": {"prompt_tokens": 1}})).is_none());
        assert_eq!(enc.done_line(), "{\"done\":true,\"model\":\"test-model\"}\n");
    }

    #[test]
    fn streaming_content_concatenates_choice_deltas() {
        let event = json!({"choices": [
            {"delta": {"content": "a"}},
            {"delta": {"content": "b"}},
        ]});
        assert_eq!(streaming_content(&event), "ab");
    }

    #[test]
    fn streaming_content_falls_back_to_message() {
        let event = json!({"choices": [{"message": {"content": "full"}}]});
        assert_eq!(streaming_content(&event), "full");

        // Delta content wins; message is ignored once a delta matched.
        let event = json!({"choices": [
            {"delta": {"content": "d"}},
            {"message": {"content": "m"}},
        ]});
        assert_eq!(streaming_content(&event), "d");
    }

    #[test]
    fn control_frames_per_encoding() {
        let frame = Frame::parse(": heartbeat\n: still-working");

        let sse = encoder(WireFormat::Sse, Schema::OpenAi);
        assert_eq!(sse.control(&frame), vec![frame.raw.clone()]);

        let ndjson = encoder(WireFormat::Ndjson, Schema::OpenAi);
        let lines = ndjson.control(&frame);
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0].trim_end()).unwrap();
        assert_eq!(parsed["type"], "heartbeat");
        assert_eq!(parsed["comment"], "heartbeat");

        let ollama = encoder(WireFormat::Ndjson, Schema::Ollama);
        assert!(ollama.control(&frame).is_empty());
    }

    #[test]
    fn unparsed_frames_per_encoding() {
        let frame = Frame::parse("data: not json {");

        let sse = encoder(WireFormat::Sse, Schema::OpenAi);
        assert_eq!(sse.unparsed(&frame), vec!["data: not json {\n\n"]);

        let ndjson = encoder(WireFormat::Ndjson, Schema::OpenAi);
        assert_eq!(ndjson.unparsed(&frame), vec!["{\"value\":\"not json {\"}\n"]);

        let ollama = encoder(WireFormat::Ndjson, Schema::Ollama);
        assert!(ollama.unparsed(&frame).is_empty());
    }

    #[test]
    fn preamble_only_for_sse() {
        let sse = encoder(WireFormat::Sse, Schema::OpenAi);
        assert_eq!(sse.preamble(), vec![": heartbeat\n\n", ": processing-prompt\n\n"]);

        let ndjson = encoder(WireFormat::Ndjson, Schema::Ollama);
        assert!(ndjson.preamble().is_empty());
    }

    #[test]
    fn non_streaming_ollama_emits_message_then_done() {
        let enc = encoder(WireFormat::Ndjson, Schema::Ollama);
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        let lines = enc.non_streaming(&body);
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0].trim_end()).unwrap();
        assert_eq!(first["message"]["content"], "hi");
        assert_eq!(first["done"], false);
        let second: Value = serde_json::from_str(lines[1].trim_end()).unwrap();
        assert_eq!(second["done"], true);
        assert_eq!(second["model"], "test-model");
    }

    #[test]
    fn non_streaming_ollama_without_content_is_done_only() {
        let enc = encoder(WireFormat::Ndjson, Schema::Ollama);
        let lines = enc.non_streaming(&json!({"error": "boom"}));
        assert_eq!(lines.len(), 1);
        let parsed: Value = serde_json::from_str(lines[0].trim_end()).unwrap();
        assert_eq!(parsed["done"], true);
    }

    #[test]
    fn buffered_flush_uses_delta_shape() {
        let enc = encoder(WireFormat::Sse, Schema::OpenAi);
        assert_eq!(
            enc.buffered_flush("xy").unwrap(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"xy\"}}]}\n\n"
        );

        let ollama = encoder(WireFormat::Ndjson, Schema::Ollama);
        let line = ollama.buffered_flush("xy").unwrap();
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["message"]["content"], "xy");
    }
}
