//! Reasoning-channel injection for `show_reasoning` mode.
//!
//! Thinking models emit a parallel `reasoning_content` field that most
//! clients hide. In `show_reasoning` mode the proxy folds that channel
//! into the visible `content` stream: the first reasoning fragment opens
//! a marked block, later fragments append, and the first piece of real
//! content after the block is set off with a Markdown rule. Content that
//! arrives *before* any reasoning is held back and replayed after the
//! block so nothing is reordered from the reader's point of view.

use serde_json::{Map, Value};

/// Separates the reasoning block from the first visible content fragment.
pub const SEPARATOR: &str = "\n\n---\n\n";

/// Prefix of the reasoning block. Three characters, trailing space included.
pub const REASONING_MARKER: &str = "💭 ";

/// Per-stream rewrite state. Owned by one request task; all flags are
/// monotone except `pending_separator`.
#[derive(Debug, Default)]
pub struct ReasoningInjector {
    seen_reasoning: bool,
    prefix_emitted: bool,
    pending_separator: bool,
    buffered_content: String,
}

impl ReasoningInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any `reasoning_content` has been observed on this stream.
    pub fn seen_reasoning(&self) -> bool {
        self.seen_reasoning
    }

    /// Take the pre-reasoning content buffer for end-of-stream flushing.
    pub fn take_buffered(&mut self) -> String {
        std::mem::take(&mut self.buffered_content)
    }

    /// Rewrite one parsed upstream event in place.
    pub fn rewrite(&mut self, event: &mut Value) {
        let Some(choices) = event.get_mut("choices").and_then(Value::as_array_mut) else {
            return;
        };
        if choices.is_empty() {
            return;
        }

        // Snapshot which deltas carried upstream content before any rewrite;
        // the separator pass below must not fire on content we injected.
        let had_original_content: Vec<bool> = choices
            .iter()
            .map(|choice| {
                choice
                    .get("delta")
                    .and_then(|d| d.get("content"))
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.is_empty())
            })
            .collect();

        for choice in choices.iter_mut() {
            if let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut) {
                self.rewrite_message(message);
            }
            if let Some(delta) = choice.get_mut("delta").and_then(Value::as_object_mut) {
                self.rewrite_delta(delta);
            }
        }

        if self.pending_separator {
            for (idx, choice) in choices.iter_mut().enumerate() {
                let Some(delta) = choice.get_mut("delta").and_then(Value::as_object_mut) else {
                    continue;
                };
                let Some(content) = delta.get("content").and_then(Value::as_str) else {
                    continue;
                };
                if had_original_content[idx] && !content.is_empty() {
                    if !content.starts_with("\n---\n") && !content.starts_with("---\n") {
                        let separated = format!("{SEPARATOR}{content}");
                        delta.insert("content".to_owned(), Value::String(separated));
                    }
                    self.pending_separator = false;
                    break;
                }
            }
        }
    }

    /// Non-streaming branch: rewrite a full `message` object.
    fn rewrite_message(&mut self, message: &mut Map<String, Value>) {
        let Some(rc) = message.get("reasoning_content").and_then(Value::as_str) else {
            return;
        };
        let rc = rc.replace("\r\n", "\n");
        message.remove("reasoning_content");
        let original = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        self.seen_reasoning = true;

        if !self.buffered_content.is_empty() || !original.is_empty() {
            let mut combined = format!("{REASONING_MARKER}{rc}{SEPARATOR}{}", self.buffered_content);
            combined.push_str(&original);
            message.insert("content".to_owned(), Value::String(combined));
            self.buffered_content.clear();
            self.pending_separator = false;
        } else {
            message.insert(
                "content".to_owned(),
                Value::String(format!("{REASONING_MARKER}{rc}")),
            );
            self.pending_separator = true;
        }
    }

    /// Streaming branch: rewrite one `delta` object.
    fn rewrite_delta(&mut self, delta: &mut Map<String, Value>) {
        if let Some(rc) = delta.get("reasoning_content").and_then(Value::as_str) {
            let rc = rc.replace("\r\n", "\n");
            delta.remove("reasoning_content");
            let original = delta
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            self.seen_reasoning = true;

            if !self.prefix_emitted {
                if !self.buffered_content.is_empty() || !original.is_empty() {
                    let mut tail = std::mem::take(&mut self.buffered_content);
                    tail.push_str(&original);
                    delta.insert(
                        "content".to_owned(),
                        Value::String(format!("{REASONING_MARKER}{rc}{SEPARATOR}{tail}")),
                    );
                    self.pending_separator = false;
                } else {
                    delta.insert(
                        "content".to_owned(),
                        Value::String(format!("{REASONING_MARKER}{rc}")),
                    );
                    self.pending_separator = true;
                }
                self.prefix_emitted = true;
            } else if original.is_empty() {
                delta.insert("content".to_owned(), Value::String(rc));
            } else {
                delta.insert(
                    "content".to_owned(),
                    Value::String(join_with_space(&rc, &original)),
                );
            }
        } else if !self.seen_reasoning {
            // No reasoning yet: hold this content back so it can follow
            // the reasoning block in reading order.
            let piece = delta
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !piece.is_empty() {
                self.buffered_content.push_str(piece);
                delta.insert("content".to_owned(), Value::String(String::new()));
            }
        }
    }
}

/// One-shot rewrite for a complete non-streaming response body. Only the
/// first choice's message is considered, matching client expectations.
pub fn rewrite_single_message(data: &mut Value) {
    let Some(message) = data
        .get_mut("choices")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("message"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    let Some(rc) = message.get("reasoning_content").and_then(Value::as_str) else {
        return;
    };
    let rc = rc.replace("\r\n", "\n");
    let original = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let content = if original.is_empty() {
        format!("{REASONING_MARKER}{rc}")
    } else {
        format!("{REASONING_MARKER}{rc}{SEPARATOR}{original}")
    };
    message.insert("content".to_owned(), Value::String(content));
    message.remove("reasoning_content");
}

/// Join two fragments with a single space unless either side already
/// provides whitespace at the boundary.
fn join_with_space(a: &str, b: &str) -> String {
    if a.is_empty() {
        return b.to_owned();
    }
    if b.is_empty() {
        return a.to_owned();
    }
    if a.ends_with(' ') || b.starts_with(' ') {
        format!("{a}{b}")
    } else {
        format!("{a} {b}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta_event(fields: Value) -> Value {
        json!({"choices": [{"delta": fields}]})
    }

    fn delta_content(event: &Value) -> &str {
        event["choices"][0]["delta"]["content"].as_str().unwrap()
    }

    #[test]
    fn first_reasoning_fragment_opens_marked_block() {
        let mut injector = ReasoningInjector::new();
        let mut event = delta_event(json!({"reasoning_content": "think"}));
        injector.rewrite(&mut event);

        assert_eq!(delta_content(&event), "💭 think");
        assert!(event["choices"][0]["delta"].get("reasoning_content").is_none());
        assert!(injector.seen_reasoning());
    }

    #[test]
    fn subsequent_reasoning_fragments_have_no_marker() {
        let mut injector = ReasoningInjector::new();
        let mut first = delta_event(json!({"reasoning_content": "think"}));
        injector.rewrite(&mut first);
        let mut second = delta_event(json!({"reasoning_content": "ing"}));
        injector.rewrite(&mut second);

        assert_eq!(delta_content(&second), "ing");
    }

    #[test]
    fn first_content_after_reasoning_gets_separator() {
        let mut injector = ReasoningInjector::new();
        let mut reasoning = delta_event(json!({"reasoning_content": "hmm"}));
        injector.rewrite(&mut reasoning);
        let mut content = delta_event(json!({"content": "answer"}));
        injector.rewrite(&mut content);

        assert_eq!(delta_content(&content), "\n\n---\n\nanswer");

        // Separator fires once.
        let mut more = delta_event(json!({"content": "more"}));
        injector.rewrite(&mut more);
        assert_eq!(delta_content(&more), "more");
    }

    #[test]
    fn separator_not_doubled_when_content_already_starts_with_rule() {
        let mut injector = ReasoningInjector::new();
        let mut reasoning = delta_event(json!({"reasoning_content": "hmm"}));
        injector.rewrite(&mut reasoning);
        let mut content = delta_event(json!({"content": "---\nanswer"}));
        injector.rewrite(&mut content);

        assert_eq!(delta_content(&content), "---\nanswer");
    }

    #[test]
    fn pre_reasoning_content_is_buffered_then_flushed_after_marker() {
        let mut injector = ReasoningInjector::new();

        let mut pre = delta_event(json!({"content": "pre"}));
        injector.rewrite(&mut pre);
        assert_eq!(delta_content(&pre), "");

        let mut reasoning = delta_event(json!({"reasoning_content": "r"}));
        injector.rewrite(&mut reasoning);
        assert_eq!(delta_content(&reasoning), "💭 r\n\n---\n\npre");

        let mut post = delta_event(json!({"content": "post"}));
        injector.rewrite(&mut post);
        assert_eq!(delta_content(&post), "post");
    }

    #[test]
    fn buffered_content_available_at_stream_end_when_no_reasoning() {
        let mut injector = ReasoningInjector::new();
        let mut first = delta_event(json!({"content": "x"}));
        injector.rewrite(&mut first);
        let mut second = delta_event(json!({"content": "y"}));
        injector.rewrite(&mut second);

        assert!(!injector.seen_reasoning());
        assert_eq!(injector.take_buffered(), "xy");
    }

    #[test]
    fn reasoning_alongside_content_in_same_delta() {
        let mut injector = ReasoningInjector::new();
        let mut event = delta_event(json!({"reasoning_content": "r", "content": "c"}));
        injector.rewrite(&mut event);

        assert_eq!(delta_content(&event), "💭 r\n\n---\n\nc");
    }

    #[test]
    fn later_reasoning_joins_same_delta_content_with_space() {
        let mut injector = ReasoningInjector::new();
        let mut first = delta_event(json!({"reasoning_content": "a"}));
        injector.rewrite(&mut first);
        let mut event = delta_event(json!({"reasoning_content": "b", "content": "c"}));
        injector.rewrite(&mut event);

        assert_eq!(delta_content(&event), "b c");
    }

    #[test]
    fn crlf_in_reasoning_is_normalized() {
        let mut injector = ReasoningInjector::new();
        let mut event = delta_event(json!({"reasoning_content": "line1\r\nline2"}));
        injector.rewrite(&mut event);

        assert_eq!(delta_content(&event), "💭 line1\nline2");
    }

    #[test]
    fn message_rewrite_folds_reasoning_into_content() {
        let mut injector = ReasoningInjector::new();
        let mut event = json!({
            "choices": [{"message": {"role": "assistant", "reasoning_content": "why", "content": "answer"}}]
        });
        injector.rewrite(&mut event);

        let message = &event["choices"][0]["message"];
        assert_eq!(message["content"], "💭 why\n\n---\n\nanswer");
        assert!(message.get("reasoning_content").is_none());
    }

    #[test]
    fn events_without_choices_are_untouched() {
        let mut injector = ReasoningInjector::new();
        let mut event = json!({"usage": {"prompt_tokens": 3}});
        let before = event.clone();
        injector.rewrite(&mut event);
        assert_eq!(event, before);
    }

    #[test]
    fn single_message_rewrite_with_content() {
        let mut data = json!({
            "choices": [{"message": {"reasoning_content": "think\r\nhard", "content": "done"}}]
        });
        rewrite_single_message(&mut data);

        assert_eq!(
            data["choices"][0]["message"]["content"],
            "💭 think\nhard\n\n---\n\ndone"
        );
    }

    #[test]
    fn single_message_rewrite_without_content() {
        let mut data = json!({"choices": [{"message": {"reasoning_content": "only"}}]});
        rewrite_single_message(&mut data);

        assert_eq!(data["choices"][0]["message"]["content"], "💭 only");
    }

    #[test]
    fn join_with_space_boundaries() {
        assert_eq!(join_with_space("a", "b"), "a b");
        assert_eq!(join_with_space("a ", "b"), "a b");
        assert_eq!(join_with_space("a", " b"), "a b");
        assert_eq!(join_with_space("", "b"), "b");
        assert_eq!(join_with_space("a", ""), "a");
    }
}
