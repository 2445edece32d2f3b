//! Streaming orchestration: drives reassembly → classification →
//! reasoning injection → encoding, and tracks active streams.
//!
//! The transform is a lazy `unfold` over the upstream byte stream, in
//! the same shape whether the client negotiated SSE or NDJSON. Output
//! ordering follows upstream frame order with two exceptions:
//! pre-reasoning content is deferred behind the reasoning prefix, and
//! once a tool call appears every encoded chunk is held until stream end.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, stream};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::encode::Encoder;
use crate::frames::{Frame, FrameBuffer, FrameEvent, classify};
use crate::reasoning::{ReasoningInjector, rewrite_single_message};

/// Delay between the last stream ending and the drain hook firing.
const DRAIN_DELAY: Duration = Duration::from_millis(100);

// ── Active-stream tracking ─────────────────────────────────────────────

/// Process-wide count of in-flight streaming responses.
///
/// Each stream holds a [`StreamGuard`]; the guard's drop is the single
/// decrement point, so cancellation, upstream errors, and clean
/// exhaustion all release exactly once. When the count drains to zero a
/// registered hook runs after a short delay on a background timer.
#[derive(Default)]
pub struct StreamTracker {
    active: AtomicUsize,
    drain_hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl StreamTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the callback invoked after the active count drains to
    /// zero. Registration only; the proxy ships a logged no-op.
    pub fn set_drain_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .drain_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Begin tracking one stream.
    pub fn start(self: &Arc<Self>) -> StreamGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        info!(active = now, "stream started");
        StreamGuard {
            tracker: Arc::clone(self),
        }
    }

    fn finish(&self) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        info!(active = remaining, "stream ended");
        if remaining > 0 {
            return;
        }
        let hook = self
            .drain_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    tokio::time::sleep(DRAIN_DELAY).await;
                    hook();
                });
            } else {
                debug!("no runtime for drain timer; invoking hook inline");
                hook();
            }
        }
    }
}

/// Scoped handle for one tracked stream; decrements on drop.
pub struct StreamGuard {
    tracker: Arc<StreamTracker>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.tracker.finish();
    }
}

// ── Tool-call buffering (C5) ───────────────────────────────────────────

/// Once engaged, encoded output is held and replayed as one chunk at
/// stream end. Engagement is monotone.
#[derive(Debug, Default)]
struct ToolCallBuffer {
    engaged: bool,
    lines: Vec<String>,
}

impl ToolCallBuffer {
    fn engage(&mut self) {
        if !self.engaged {
            debug!("tool call detected; buffering output until stream end");
            self.engaged = true;
        }
    }

    fn drain(&mut self) -> Option<String> {
        if self.lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.lines).concat())
        }
    }
}

// ── Transform stream (C6) ──────────────────────────────────────────────

struct TransformState {
    upstream: BoxStream<'static, Result<Bytes, io::Error>>,
    frames: FrameBuffer,
    encoder: Encoder,
    injector: Option<ReasoningInjector>,
    tool_calls: ToolCallBuffer,
    done_received: bool,
    finished: bool,
    pending: VecDeque<Bytes>,
    _guard: Option<StreamGuard>,
}

impl TransformState {
    fn emit(&mut self, line: String) {
        if self.tool_calls.engaged {
            self.tool_calls.lines.push(line);
        } else {
            self.pending.push_back(Bytes::from(line));
        }
    }

    fn process(&mut self, frame_text: String) {
        match classify(Frame::parse(&frame_text)) {
            FrameEvent::Control(frame) => {
                for line in self.encoder.control(&frame) {
                    self.emit(line);
                }
            }
            FrameEvent::Done => {
                self.done_received = true;
                // Content held for a reasoning block that never came must
                // land before the terminator.
                self.flush_pre_reasoning();
                let line = self.encoder.done_line();
                self.emit(line);
            }
            FrameEvent::Event {
                mut value,
                tool_call,
            } => {
                if tool_call {
                    self.tool_calls.engage();
                }
                if let Some(injector) = self.injector.as_mut() {
                    injector.rewrite(&mut value);
                }
                if let Some(line) = self.encoder.event(&value) {
                    self.emit(line);
                }
            }
            FrameEvent::Unparsed { frame, tool_call } => {
                if tool_call {
                    self.tool_calls.engage();
                }
                for line in self.encoder.unparsed(&frame) {
                    self.emit(line);
                }
            }
        }
    }

    /// Emit content that was held back for a reasoning block that never
    /// arrived. No-op once the buffer is empty or reasoning was seen.
    fn flush_pre_reasoning(&mut self) {
        if let Some(injector) = self.injector.as_mut()
            && !injector.seen_reasoning()
        {
            let buffered = injector.take_buffered();
            if !buffered.is_empty()
                && let Some(line) = self.encoder.buffered_flush(&buffered)
            {
                self.emit(line);
            }
        }
    }

    /// End-of-body finalization: tool-call flush, then deferred content,
    /// then a synthesized terminator if upstream never sent `[DONE]`.
    fn finalize(&mut self) {
        if let Some(flush) = self.tool_calls.drain() {
            self.pending.push_back(Bytes::from(flush));
        }
        if let Some(injector) = self.injector.as_mut()
            && !injector.seen_reasoning()
        {
            let buffered = injector.take_buffered();
            if !buffered.is_empty()
                && let Some(line) = self.encoder.buffered_flush(&buffered)
            {
                self.pending.push_back(Bytes::from(line));
            }
        }
        if !self.done_received {
            self.pending.push_back(Bytes::from(self.encoder.done_line()));
        }
    }
}

/// Transform an upstream SSE byte stream into the negotiated client
/// encoding. The output is lazy: it advances only as upstream bytes
/// arrive and the client drains chunks.
pub fn transform_sse_stream<S>(
    byte_stream: S,
    encoder: Encoder,
    inject_reasoning: bool,
    guard: Option<StreamGuard>,
) -> impl Stream<Item = Result<Bytes, io::Error>>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
{
    let mut pending = VecDeque::new();
    for line in encoder.preamble() {
        pending.push_back(Bytes::from(line));
    }

    let state = TransformState {
        upstream: byte_stream.boxed(),
        frames: FrameBuffer::new(),
        encoder,
        injector: inject_reasoning.then(ReasoningInjector::new),
        tool_calls: ToolCallBuffer::default(),
        done_received: false,
        finished: false,
        pending,
        _guard: guard,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.finished {
                return None;
            }
            match st.upstream.next().await {
                Some(Ok(bytes)) => {
                    let frames = st.frames.push(&bytes);
                    for frame in frames {
                        st.process(frame);
                    }
                }
                Some(Err(e)) => {
                    // Never fatal mid-stream: synthesize the terminator
                    // and let the client see a complete body.
                    warn!("upstream stream error: {e}");
                    st.finished = true;
                    st.finalize();
                }
                None => {
                    st.finished = true;
                    st.finalize();
                }
            }
        }
    })
}

/// One-shot emission for a non-SSE upstream body observed on the
/// streaming path: optional reasoning rewrite, then exactly one
/// representation in the negotiated encoding (preceded by the SSE
/// preamble when applicable).
pub fn non_streaming_chunks(raw: &[u8], encoder: &Encoder, inject_reasoning: bool) -> Vec<String> {
    let mut out = encoder.preamble();
    match serde_json::from_slice::<Value>(raw) {
        Ok(mut data) => {
            if inject_reasoning {
                rewrite_single_message(&mut data);
            }
            out.extend(encoder.non_streaming(&data));
        }
        Err(_) => {
            let text = String::from_utf8_lossy(raw).into_owned();
            out.extend(encoder.non_streaming(&Value::String(text)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracker_counts_and_releases() {
        let tracker = StreamTracker::new();
        assert_eq!(tracker.active(), 0);

        let a = tracker.start();
        let b = tracker.start();
        assert_eq!(tracker.active(), 2);

        drop(a);
        assert_eq!(tracker.active(), 1);
        drop(b);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn drain_hook_fires_after_delay_on_zero() {
        let tracker = StreamTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        tracker.set_drain_hook(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        let guard = tracker.start();
        drop(guard);
        assert_eq!(fired.load(Ordering::SeqCst), 0, "hook must wait for the timer");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_hook_not_fired_while_streams_remain() {
        let tracker = StreamTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        tracker.set_drain_hook(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        let a = tracker.start();
        let b = tracker.start();
        drop(a);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drop(b);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tool_call_buffer_drains_in_insertion_order() {
        let mut buffer = ToolCallBuffer::default();
        buffer.engage();
        buffer.lines.push("one\n".to_owned());
        buffer.lines.push("two\n".to_owned());

        assert_eq!(buffer.drain().unwrap(), "one\ntwo\n");
        assert!(buffer.drain().is_none());
    }
}
