//! Server-sent-event reassembly for streamed completions.
//!
//! A streamed completion arrives as `data: <json>` lines terminated by
//! `data: [DONE]`. [`StreamAggregator`] decodes each line, accumulates the
//! text deltas and hands them out as fragments under a dual flush policy:
//! a fragment is emitted as soon as the buffer holds `chunk_size` bytes
//! **or** `flush_interval` has passed since the previous flush.
//!
//! Both conditions are checked once, right after a delta is appended, so a
//! delta that satisfies both still yields exactly one fragment. Every flush
//! restarts the interval, whichever condition caused it.
//!
//! [`StreamAggregator::spawn`] drives the aggregator over a byte stream on a
//! background task and returns two channels: the fragments, and a one-shot
//! terminal signal carrying either the assembled completion or the error.

use std::collections::BTreeMap;
use std::time::Duration;

use agentrelay_config::StreamingConfig;
use agentrelay_core::error::StreamError;
use agentrelay_core::message::{Message, MessageToolCall};
use agentrelay_core::provider::{ByteStream, FinishReason, ProviderResponse, Usage};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{trace, warn};

const DONE_SENTINEL: &str = "[DONE]";

/// Flush policy and channel sizing.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Flush once the buffer holds at least this many bytes.
    pub chunk_size: usize,
    /// Flush once this long has passed since the previous flush.
    pub flush_interval: Duration,
    /// Capacity of the fragment channel.
    pub fragment_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            flush_interval: Duration::from_millis(500),
            fragment_capacity: 32,
        }
    }
}

impl From<&StreamingConfig> for StreamSettings {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            ..Self::default()
        }
    }
}

/// The fully reassembled completion, delivered once the stream ends cleanly.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    /// Concatenation of every content delta.
    pub content: String,
    pub tool_calls: Vec<MessageToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    pub model: String,
}

impl StreamOutcome {
    pub fn into_response(self) -> ProviderResponse {
        ProviderResponse {
            message: Message::assistant_with_tools(self.content, self.tool_calls),
            finish_reason: self.finish_reason,
            usage: self.usage,
            model: self.model,
        }
    }
}

/// What the caller should do after feeding one line.
#[derive(Debug, PartialEq)]
pub enum Step {
    /// Keep feeding lines; emit the fragment if there is one.
    Continue(Option<String>),
    /// The sentinel arrived; emit the final fragment if there is one.
    Done(Option<String>),
    /// A payload could not be used; emit the partial fragment, then fail.
    Failed(Option<String>, StreamError),
}

/// Receiving side of a spawned aggregation.
pub struct StreamHandle {
    /// Ordered text fragments; closes after the last one.
    pub fragments: mpsc::Receiver<String>,
    /// Terminal signal, sent after the last fragment.
    pub done: oneshot::Receiver<Result<StreamOutcome, StreamError>>,
}

/// Incremental SSE decoder with a size/time flush policy.
pub struct StreamAggregator {
    settings: StreamSettings,
    buffer: String,
    last_flush: Instant,
    content: String,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    model: String,
}

impl StreamAggregator {
    /// Create an aggregator whose flush interval starts counting at `now`.
    pub fn new(settings: StreamSettings, now: Instant) -> Self {
        Self {
            settings,
            buffer: String::new(),
            last_flush: now,
            content: String::new(),
            tool_calls: BTreeMap::new(),
            finish_reason: None,
            usage: None,
            model: String::new(),
        }
    }

    /// Feed one line (without or with its trailing newline).
    pub fn push_line(&mut self, line: &str, now: Instant) -> Step {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return Step::Continue(None);
        }

        let Some(data) = line.strip_prefix("data:") else {
            trace!(line = %line, "Ignoring non-data SSE field");
            return Step::Continue(None);
        };
        let data = data.trim_start();

        if data == DONE_SENTINEL {
            return Step::Done(self.take_buffer(now));
        }

        let chunk: StreamResponse = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                let error = StreamError::Decode {
                    line: data.to_string(),
                    reason: e.to_string(),
                };
                return Step::Failed(self.take_buffer(now), error);
            }
        };

        if let Some(error) = chunk.error {
            return Step::Failed(self.take_buffer(now), StreamError::Backend(error.to_string()));
        }

        self.apply(chunk);
        Step::Continue(self.maybe_flush(now))
    }

    /// Assemble the completion seen so far.
    pub fn finish(self) -> StreamOutcome {
        StreamOutcome {
            content: self.content,
            tool_calls: self
                .tool_calls
                .into_iter()
                .map(|(index, acc)| acc.into_tool_call(index))
                .collect(),
            finish_reason: self.finish_reason,
            usage: self.usage,
            model: self.model,
        }
    }

    fn apply(&mut self, chunk: StreamResponse) {
        if let Some(model) = chunk.model {
            self.model = model;
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(text) = choice.delta.content {
            self.buffer.push_str(&text);
            self.content.push_str(&text);
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let acc = self.tool_calls.entry(tc.index).or_default();
            if let Some(id) = tc.id {
                acc.id = id;
            }
            if let Some(func) = tc.function {
                if let Some(name) = func.name {
                    acc.name.push_str(&name);
                }
                if let Some(args) = func.arguments {
                    acc.arguments.push_str(&args);
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(FinishReason::from(reason));
        }
    }

    fn maybe_flush(&mut self, now: Instant) -> Option<String> {
        let size_reached = self.buffer.len() >= self.settings.chunk_size;
        let interval_reached = now.saturating_duration_since(self.last_flush) >= self.settings.flush_interval;
        if size_reached || interval_reached {
            self.take_buffer(now)
        } else {
            None
        }
    }

    fn take_buffer(&mut self, now: Instant) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        self.last_flush = now;
        Some(std::mem::take(&mut self.buffer))
    }

    /// Drive `stream` on a background task.
    ///
    /// The fragment channel is bounded: if the caller stops reading, the
    /// task waits. Dropping the fragment receiver is allowed; the terminal
    /// signal still carries the full content.
    pub fn spawn(stream: ByteStream, settings: StreamSettings) -> StreamHandle {
        let (tx, fragments) = mpsc::channel(settings.fragment_capacity.max(1));
        let (done_tx, done) = oneshot::channel();

        tokio::spawn(async move {
            let aggregator = Self::new(settings, Instant::now());
            let result = aggregator.run(stream, &tx).await;
            drop(tx);
            let _ = done_tx.send(result);
        });

        StreamHandle { fragments, done }
    }

    async fn run(mut self, mut stream: ByteStream, tx: &mpsc::Sender<String>) -> Result<StreamOutcome, StreamError> {
        let mut pending: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    emit(tx, self.take_buffer(Instant::now())).await;
                    return Err(StreamError::Interrupted(e.to_string()));
                }
            };
            pending.extend_from_slice(&bytes);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                match self.push_line(&line, Instant::now()) {
                    Step::Continue(fragment) => emit(tx, fragment).await,
                    Step::Done(fragment) => {
                        emit(tx, fragment).await;
                        return Ok(self.finish());
                    }
                    Step::Failed(fragment, error) => {
                        emit(tx, fragment).await;
                        return Err(error);
                    }
                }
            }
        }

        // Last line may lack its newline.
        if !pending.is_empty() {
            let line = String::from_utf8_lossy(&pending).into_owned();
            match self.push_line(&line, Instant::now()) {
                Step::Continue(fragment) => emit(tx, fragment).await,
                Step::Done(fragment) => {
                    emit(tx, fragment).await;
                    return Ok(self.finish());
                }
                Step::Failed(fragment, error) => {
                    emit(tx, fragment).await;
                    return Err(error);
                }
            }
        }

        warn!("SSE stream ended without [DONE] sentinel");
        emit(tx, self.take_buffer(Instant::now())).await;
        Ok(self.finish())
    }
}

async fn emit(tx: &mpsc::Sender<String>, fragment: Option<String>) {
    if let Some(fragment) = fragment {
        // A dropped receiver only loses the incremental view.
        let _ = tx.send(fragment).await;
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta — arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self, index: u32) -> MessageToolCall {
        let id = if self.id.is_empty() {
            format!("call_{index}")
        } else {
            self.id
        };
        MessageToolCall {
            id,
            name: self.name,
            arguments: self.arguments,
        }
    }
}
