use std::fmt::Display;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ResponseMetadata;
use crate::messages::MessageContent;
use crate::tool_calls::{AssembledToolCall, ToolCallAssembler, ToolCallDelta};
use crate::usage::{Usage, UsagePayload};

pub const DONE_SENTINEL: &str = "[DONE]";

/// Longest run of bytes without a newline the decoder will buffer.
pub const MAX_PENDING_LINE_BYTES: usize = 4 * 1024 * 1024;

const TOOL_CALLS_FINISH_REASON: &str = "tool_calls";

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text { content: String },
    ToolCall(AssembledToolCall),
    Done(StreamSummary),
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamSummary {
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub request_id: Option<String>,
    pub system_fingerprint: Option<String>,
    pub reasoning_tokens: Option<u64>,
    pub cache: Option<CacheStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatus {
    pub cached_tokens: u64,
    pub hit_percent: f64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    system_fingerprint: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<MessageContent>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Latest non-empty value of each field seen so far.
#[derive(Debug, Default)]
struct TrackedMetadata {
    request_id: Option<String>,
    model: Option<String>,
    provider: Option<String>,
    system_fingerprint: Option<String>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl TrackedMetadata {
    fn observe(&mut self, chunk: &StreamChunk) {
        keep_latest(&mut self.request_id, chunk.id.as_deref());
        keep_latest(&mut self.model, chunk.model.as_deref());
        keep_latest(&mut self.provider, chunk.provider.as_deref());
        keep_latest(
            &mut self.system_fingerprint,
            chunk.system_fingerprint.as_deref(),
        );
        if let Some(usage) = chunk.usage.as_ref().filter(|usage| !usage.is_empty()) {
            self.usage = Some(usage.normalize());
        }
    }

    fn summary(&self) -> StreamSummary {
        let cache = self.usage.and_then(|usage| {
            Some(CacheStatus {
                cached_tokens: usage.cached_tokens?,
                hit_percent: usage.cache_hit_percent()?,
            })
        });

        StreamSummary {
            usage: self.usage,
            finish_reason: self.finish_reason.clone(),
            model: self.model.clone(),
            provider: self.provider.clone(),
            request_id: self.request_id.clone(),
            system_fingerprint: self.system_fingerprint.clone(),
            reasoning_tokens: self.usage.and_then(|usage| usage.reasoning_tokens),
            cache,
        }
    }
}

/// Line-oriented event-stream decoder for one response body.
#[derive(Debug)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    assembler: ToolCallAssembler,
    metadata: TrackedMetadata,
    finished: bool,
}

impl StreamDecoder {
    /// Header metadata seeds the tracked values; chunk values override it.
    pub fn new(headers: ResponseMetadata) -> Self {
        Self {
            pending: Vec::new(),
            assembler: ToolCallAssembler::new(),
            metadata: TrackedMetadata {
                request_id: headers.request_id,
                model: headers.model,
                provider: headers.provider,
                system_fingerprint: headers.system_fingerprint,
                usage: None,
                finish_reason: None,
            },
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds raw body bytes and returns the events of every completed line.
    /// Nothing is returned once a terminal event has been produced.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.pending.extend_from_slice(bytes);
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline).collect::<Vec<_>>();
            self.process_line(&String::from_utf8_lossy(&line), &mut events);
            if self.finished {
                self.pending.clear();
                return events;
            }
        }

        if self.pending.len() > MAX_PENDING_LINE_BYTES {
            self.finished = true;
            self.pending.clear();
            events.push(StreamEvent::Error {
                message: format!(
                    "stream line exceeded {MAX_PENDING_LINE_BYTES} bytes without a line break"
                ),
            });
        }
        events
    }

    /// End of input. A trailing unterminated line is still processed; without
    /// the sentinel, pending tool calls are flushed and `done` is emitted.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        let remainder = std::mem::take(&mut self.pending);
        if !remainder.is_empty() {
            self.process_line(&String::from_utf8_lossy(&remainder), &mut events);
        }
        if !self.finished {
            self.complete(&mut events);
        }
        events
    }

    fn process_line(&mut self, raw_line: &str, events: &mut Vec<StreamEvent>) {
        let line = raw_line.trim();
        if line.is_empty() {
            return;
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return;
        };
        if data == DONE_SENTINEL {
            self.complete(events);
            return;
        }

        let chunk = match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(error = %err, "skipping malformed stream chunk");
                return;
            }
        };
        self.metadata.observe(&chunk);

        if let Some(error) = chunk.error.as_ref().filter(|error| !error.is_null()) {
            self.finished = true;
            events.push(StreamEvent::Error {
                message: stream_error_message(error),
            });
            return;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };
        if let Some(delta) = choice.delta {
            if let Some(text) = delta.content.map(|content| content.to_plain_text())
                && !text.is_empty()
            {
                events.push(StreamEvent::Text { content: text });
            }
            for tool_delta in delta.tool_calls.iter().flatten() {
                self.assembler.ingest(tool_delta);
            }
        }

        if let Some(reason) = choice.finish_reason.filter(|reason| !reason.is_empty()) {
            if reason == TOOL_CALLS_FINISH_REASON {
                self.flush_tool_calls(events);
            }
            self.metadata.finish_reason = Some(reason);
        }
    }

    fn flush_tool_calls(&mut self, events: &mut Vec<StreamEvent>) {
        events.extend(
            self.assembler
                .drain_usable()
                .into_iter()
                .map(StreamEvent::ToolCall),
        );
    }

    fn complete(&mut self, events: &mut Vec<StreamEvent>) {
        self.flush_tool_calls(events);
        self.finished = true;
        events.push(StreamEvent::Done(self.metadata.summary()));
    }
}

/// Instant by which a whole streamed call must have finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDeadline {
    at: Instant,
    timeout: Duration,
}

impl StreamDeadline {
    pub fn after(started_at: Instant, timeout: Duration) -> Self {
        let at = started_at
            .checked_add(timeout)
            .unwrap_or_else(|| started_at + FAR_FUTURE);
        Self { at, timeout }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    fn expired_message(&self) -> String {
        format!(
            "llm stream timed out after {}ms",
            u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
        )
    }
}

/// Decodes a byte stream into events. Cancellation ends the stream without
/// an event; a read failure or the deadline passing ends it with one `error`
/// event.
pub fn decode_event_stream<S, B, E>(
    body: S,
    headers: ResponseMetadata,
    cancel: CancellationToken,
    deadline: StreamDeadline,
) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut expired = Box::pin(tokio::time::sleep_until(deadline.at()));
        let mut decoder = StreamDecoder::new(headers);

        loop {
            let events = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = &mut expired => vec![StreamEvent::Error {
                    message: deadline.expired_message(),
                }],
                next = body.next() => match next {
                    Some(Ok(bytes)) => decoder.push(bytes.as_ref()),
                    Some(Err(err)) => vec![StreamEvent::Error {
                        message: format!("stream read failed: {err}"),
                    }],
                    None => decoder.finish(),
                },
            };
            let mut ended = events.is_empty() && decoder.is_finished();
            for event in events {
                ended |= event.is_terminal();
                yield event;
            }
            if ended {
                return;
            }
        }
    }
}

fn keep_latest(slot: &mut Option<String>, candidate: Option<&str>) {
    if let Some(value) = candidate.map(str::trim).filter(|value| !value.is_empty()) {
        *slot = Some(value.to_string());
    }
}

fn stream_error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        _ => error
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| error.to_string()),
    }
}
