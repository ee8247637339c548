//! SSE parser for the OpenAI Chat Completions API.
//!
//! Converts a raw `reqwest::Response` byte stream into the canonical
//! [`ChunkStream`]. Chat completions interleave `reasoning_content` and
//! `content` deltas inside a single choice, so the parser tracks which
//! logical block is open and emits start/end chunks on transitions.
//! Tool-call fragments are accumulated per index and emitted as
//! complete [`StreamChunk::ToolUse`] chunks when the turn finishes.

use std::collections::{HashMap, VecDeque};

use converse::chunk::{ChunkStream, StopReason, StreamChunk, StreamError, StreamItem, StreamResult};
use converse::content::ToolUseBlock;
use converse::usage::TokenUsage;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::convert::{convert_stop_reason, transport_error};
use crate::types::{ChatChunk, ResponseUsage};

/// Cap on the UTF-8 accumulation buffer before the stream is aborted.
const MAX_UTF8_BUF: usize = 16 * 1024 * 1024; // 16 MiB

/// Which logical block is currently open.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
enum Mode {
    #[default]
    Idle,
    Thinking,
    Content,
}

/// State tracked per in-flight tool call during streaming.
#[derive(Debug)]
struct ToolCallState {
    id: String,
    name: String,
    arguments_buf: String,
}

/// A completed tool call, kept for native-content reconstruction.
#[derive(Debug)]
struct CompletedCall {
    id: String,
    name: String,
    arguments_raw: String,
}

/// Incremental parser state, fed raw bytes, yielding stream items.
#[derive(Debug, Default)]
pub(crate) struct Parser {
    sse_buf: String,
    utf8_buf: Vec<u8>,
    mode: Mode,
    tool_states: HashMap<u32, ToolCallState>,
    completed_calls: Vec<CompletedCall>,
    text: String,
    stop_reason: Option<StopReason>,
    usage: TokenUsage,
    /// Prefill withheld from the request, prepended to the first
    /// content delta.
    prefill: Option<String>,
    done: bool,
}

impl Parser {
    pub(crate) fn new(prefill: Option<String>) -> Self {
        Self {
            prefill,
            ..Default::default()
        }
    }

    /// Feeds raw bytes, returning the items they complete.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<StreamItem> {
        if self.done {
            return Vec::new();
        }

        self.utf8_buf.extend_from_slice(bytes);
        if self.utf8_buf.len() > MAX_UTF8_BUF {
            return vec![self.fail(StreamError {
                message: "SSE stream buffer exceeded 16 MiB".into(),
                status: None,
            })];
        }

        match std::str::from_utf8(&self.utf8_buf) {
            Ok(text) => {
                self.sse_buf.push_str(text);
                self.utf8_buf.clear();
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if valid_up_to > 0 {
                    // from_utf8 validated this prefix.
                    let valid =
                        unsafe { std::str::from_utf8_unchecked(&self.utf8_buf[..valid_up_to]) };
                    self.sse_buf.push_str(valid);
                }
                if let Some(error_len) = e.error_len() {
                    // Permanently invalid bytes; skip them.
                    self.utf8_buf.drain(..valid_up_to + error_len);
                } else {
                    // Incomplete sequence; wait for more bytes.
                    self.utf8_buf.drain(..valid_up_to);
                }
            }
        }

        let mut items = Vec::new();
        while let Some((pos, delim_len)) = event_boundary(&self.sse_buf) {
            let event_text: String = self.sse_buf.drain(..pos + delim_len).collect();
            if let Some(data) = extract_data_line(&event_text) {
                items.extend(self.handle_data(data.to_string()));
                if self.done {
                    break;
                }
            }
        }
        items
    }

    /// The terminal item for a stream that ended without `[DONE]`.
    pub(crate) fn finish(&mut self) -> Option<StreamItem> {
        if self.done {
            return None;
        }
        Some(self.fail(StreamError {
            message: "stream ended before completion".into(),
            status: None,
        }))
    }

    /// Terminates with `error`, keeping partial output.
    pub(crate) fn fail(&mut self, error: StreamError) -> StreamItem {
        self.done = true;
        StreamItem::Done(self.build_result(Some(error)))
    }

    fn handle_data(&mut self, data: String) -> Vec<StreamItem> {
        if data == "[DONE]" {
            let mut items = self.close_open_block();
            items.extend(self.flush_pending_tools());
            self.done = true;
            items.push(StreamItem::Done(self.build_result(None)));
            return items;
        }

        let Ok(chunk) = serde_json::from_str::<ChatChunk>(&data) else {
            return Vec::new();
        };

        let mut items = Vec::new();
        if let Some(choice) = chunk.choices.first() {
            if let Some(reasoning) = &choice.delta.reasoning_content {
                if !reasoning.is_empty() {
                    items.extend(self.enter_mode(Mode::Thinking));
                    items.push(StreamItem::Chunk(StreamChunk::ThinkingDelta {
                        text: reasoning.clone(),
                    }));
                }
            }

            if let Some(text) = &choice.delta.content {
                if !text.is_empty() {
                    items.extend(self.enter_mode(Mode::Content));
                    self.text.push_str(text);
                    items.push(StreamItem::Chunk(StreamChunk::ContentDelta {
                        text: text.clone(),
                    }));
                }
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for fragment in tool_calls {
                    if let Some(id) = &fragment.id {
                        let name = fragment
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default();
                        self.tool_states.insert(
                            fragment.index,
                            ToolCallState {
                                id: id.clone(),
                                name,
                                arguments_buf: String::new(),
                            },
                        );
                    }
                    if let Some(args) = fragment.function.as_ref().and_then(|f| f.arguments.as_ref())
                    {
                        if let Some(state) = self.tool_states.get_mut(&fragment.index) {
                            state.arguments_buf.push_str(args);
                        }
                    }
                }
            }

            if let Some(reason) = &choice.finish_reason {
                self.stop_reason = Some(convert_stop_reason(reason));
                items.extend(self.close_open_block());
                items.extend(self.flush_pending_tools());
            }
        }

        if let Some(usage) = &chunk.usage {
            items.push(self.record_usage(usage));
        }

        items
    }

    /// Opens `mode`, closing whatever block was open. Consumes the
    /// withheld prefill when the first content block opens.
    fn enter_mode(&mut self, mode: Mode) -> Vec<StreamItem> {
        if self.mode == mode {
            return Vec::new();
        }
        let mut items = self.close_open_block();
        self.mode = mode;
        match mode {
            Mode::Thinking => items.push(StreamItem::Chunk(StreamChunk::ThinkingStart)),
            Mode::Content => {
                items.push(StreamItem::Chunk(StreamChunk::ContentStart));
                if let Some(prefill) = self.prefill.take() {
                    self.text.push_str(&prefill);
                    items.push(StreamItem::Chunk(StreamChunk::ContentDelta {
                        text: prefill,
                    }));
                }
            }
            Mode::Idle => {}
        }
        items
    }

    fn close_open_block(&mut self) -> Vec<StreamItem> {
        let items = match self.mode {
            Mode::Thinking => vec![StreamItem::Chunk(StreamChunk::ThinkingEnd)],
            Mode::Content => vec![StreamItem::Chunk(StreamChunk::ContentEnd)],
            Mode::Idle => Vec::new(),
        };
        self.mode = Mode::Idle;
        items
    }

    /// Emits complete tool calls for every accumulated fragment set, in
    /// index order.
    fn flush_pending_tools(&mut self) -> Vec<StreamItem> {
        let mut indices: Vec<u32> = self.tool_states.keys().copied().collect();
        indices.sort_unstable();

        let mut items = Vec::new();
        for index in indices {
            let Some(state) = self.tool_states.remove(&index) else {
                continue;
            };
            let arguments_raw = if state.arguments_buf.is_empty() {
                "{}".to_string()
            } else {
                state.arguments_buf
            };
            let input: Value = serde_json::from_str(&arguments_raw).unwrap_or_else(|_| json!({}));
            items.push(StreamItem::Chunk(StreamChunk::ToolUse(ToolUseBlock {
                id: state.id.clone(),
                name: state.name.clone(),
                input,
            })));
            self.completed_calls.push(CompletedCall {
                id: state.id,
                name: state.name,
                arguments_raw,
            });
        }
        items
    }

    /// Usage arrives once, in the final chunk before `[DONE]`.
    fn record_usage(&mut self, usage: &ResponseUsage) -> StreamItem {
        let report = TokenUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            reasoning_tokens: usage
                .completion_tokens_details
                .as_ref()
                .and_then(|d| d.reasoning_tokens),
            cache_creation_tokens: None,
            cache_read_tokens: usage
                .prompt_tokens_details
                .as_ref()
                .and_then(|d| d.cached_tokens),
        };
        self.usage = report;
        StreamItem::Chunk(StreamChunk::TokenUsage(report))
    }

    fn build_result(&mut self, error: Option<StreamError>) -> StreamResult {
        // A withheld prefill still belongs to the reply even if no
        // content delta ever arrived.
        let mut text = self.text.clone();
        if let Some(prefill) = self.prefill.take() {
            text = prefill + &text;
        }

        let native = if text.is_empty() && self.completed_calls.is_empty() {
            None
        } else {
            let mut native = json!({
                "content": if text.is_empty() { Value::Null } else { json!(text) },
            });
            if !self.completed_calls.is_empty() {
                let calls: Vec<Value> = self
                    .completed_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments_raw,
                            },
                        })
                    })
                    .collect();
                native["tool_calls"] = Value::Array(calls);
            }
            Some(native)
        };

        let stop_reason = if error.is_some() {
            StopReason::Error
        } else {
            self.stop_reason.unwrap_or(StopReason::EndTurn)
        };
        StreamResult {
            text_content: text,
            native_content: native,
            stop_reason,
            usage: self.usage,
            error,
        }
    }
}

/// Wraps a validated streaming response into a [`ChunkStream`].
pub(crate) fn into_stream(response: reqwest::Response, prefill: Option<String>) -> ChunkStream {
    let bytes = response.bytes_stream();
    let parser = Parser::new(prefill);
    let queue: VecDeque<StreamItem> = VecDeque::new();

    Box::pin(futures::stream::unfold(
        (bytes, parser, queue, false),
        |(mut bytes, mut parser, mut queue, mut finished)| async move {
            loop {
                if let Some(item) = queue.pop_front() {
                    if matches!(item, StreamItem::Done(_)) {
                        queue.clear();
                        finished = true;
                    }
                    return Some((item, (bytes, parser, queue, finished)));
                }
                if finished {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => queue.extend(parser.feed(&chunk)),
                    Some(Err(err)) => queue.push_back(parser.fail(transport_error(&err))),
                    None => {
                        if let Some(item) = parser.finish() {
                            queue.push_back(item);
                        } else {
                            return None;
                        }
                    }
                }
            }
        },
    ))
}

/// Finds the earliest SSE event boundary, returning its byte offset
/// and delimiter length. Servers frame events with a blank line, which
/// arrives as either `\n\n` or `\r\n\r\n`.
fn event_boundary(buf: &str) -> Option<(usize, usize)> {
    let lf = buf.find("\n\n").map(|pos| (pos, 2));
    let crlf = buf.find("\r\n\r\n").map(|pos| (pos, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Extracts the `data: ` payload from one SSE event block.
fn extract_data_line(event_text: &str) -> Option<&str> {
    for line in event_text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data: ") {
            return Some(data);
        }
    }
    None
}
