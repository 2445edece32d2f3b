//! SSE frame reassembly and event classification.
//!
//! Upstream bytes arrive in arbitrary TCP-sized chunks. Frames are the
//! `\n\n`-delimited units of an SSE stream; splitting happens on the raw
//! byte buffer so chunk boundaries (including ones inside multi-byte
//! UTF-8 sequences) never change the produced frames.

use bytes::BytesMut;
use serde_json::Value;

const FRAME_DELIMITER: &[u8] = b"\n\n";

/// Rolling reassembly buffer. Feed it chunks, take back complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete frame it finishes.
    /// Blank frames (whitespace only) are dropped; the trailing partial
    /// frame stays buffered for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = find_delimiter(&self.buf) {
            let frame = self.buf.split_to(pos);
            let _ = self.buf.split_to(FRAME_DELIMITER.len());
            let text = String::from_utf8_lossy(&frame).into_owned();
            if !text.trim().is_empty() {
                frames.push(text);
            }
        }
        frames
    }
}

fn find_delimiter(buf: &BytesMut) -> Option<usize> {
    buf.windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
}

/// A reassembled SSE frame, split into its line roles.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Original frame text with the `\n\n` delimiter restored, for
    /// verbatim forwarding to SSE clients.
    pub raw: String,
    /// Joined payload of the `data:` lines, if any.
    pub payload: Option<String>,
    /// Comment lines (`: ...`) with the leading colon stripped.
    pub comments: Vec<String>,
}

impl Frame {
    /// Parse one frame. `data:` suffixes are left-trimmed and joined
    /// with `\n`; `:`-prefixed lines are SSE comments; anything else
    /// (`event:`, `id:`, ...) is control and carried only in `raw`.
    pub fn parse(text: &str) -> Self {
        let mut data_lines = Vec::new();
        let mut comments = Vec::new();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start());
            } else if let Some(rest) = line.strip_prefix(':') {
                comments.push(rest.trim().to_owned());
            }
        }

        let payload = if data_lines.is_empty() {
            None
        } else {
            Some(data_lines.join("\n"))
        };

        Self {
            raw: format!("{text}\n\n"),
            payload,
            comments,
        }
    }
}

/// A classified frame, dispatched on by the stream orchestrator.
#[derive(Debug)]
pub enum FrameEvent {
    /// No `data:` lines at all — comments and control lines only.
    Control(Frame),
    /// Terminal `[DONE]` sentinel.
    Done,
    /// Parsed JSON payload. `tool_call` is set when the raw payload
    /// mentions a tool call, which flips the stream into buffering mode.
    Event { value: Value, tool_call: bool },
    /// `data:` payload that is not valid JSON; forwarded degraded.
    Unparsed { frame: Frame, tool_call: bool },
}

/// Classify a parsed frame (C2).
pub fn classify(frame: Frame) -> FrameEvent {
    let Some(payload) = frame.payload.as_deref() else {
        return FrameEvent::Control(frame);
    };

    if payload.trim() == "[DONE]" {
        return FrameEvent::Done;
    }

    let tool_call = payload.contains("tool_call") || payload.contains("tool_calls");

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => FrameEvent::Event { value, tool_call },
        Err(_) => FrameEvent::Unparsed { frame, tool_call },
    }
}
