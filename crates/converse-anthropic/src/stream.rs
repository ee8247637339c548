//! SSE parser for the Anthropic Messages API.
//!
//! Converts a raw `reqwest::Response` byte stream into the canonical
//! [`ChunkStream`]. Handles UTF-8 boundary splitting, tool-input
//! accumulation across `input_json_delta` events, native content
//! reconstruction for exact resubmission, and the exactly-one-terminal
//! guarantee: whatever the wire does, the stream ends with a single
//! `Done` item.

use std::collections::{BTreeMap, HashMap, VecDeque};

use converse::chunk::{ChunkStream, StopReason, StreamChunk, StreamError, StreamItem, StreamResult};
use converse::content::{Citation, SearchResult, ToolUseBlock};
use converse::usage::TokenUsage;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::convert::transport_error;
use crate::types::{BlockDelta, ContentBlockStart, ResponseUsage, SseEvent};

/// Cap on the UTF-8 accumulation buffer before the stream is aborted.
const MAX_UTF8_BUF: usize = 16 * 1024 * 1024; // 16 MiB

/// What kind of block each stream index currently holds.
#[derive(Debug)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse {
        id: String,
        name: String,
        json_buf: String,
    },
    WebSearch {
        id: String,
        json_buf: String,
    },
    WebFetch {
        id: String,
        json_buf: String,
    },
    Other,
}

/// Incremental parser state, fed raw bytes, yielding stream items.
#[derive(Debug, Default)]
pub(crate) struct Parser {
    sse_buf: String,
    utf8_buf: Vec<u8>,
    blocks: HashMap<u32, BlockKind>,
    /// Native content blocks reconstructed per stream index.
    native: BTreeMap<u32, Value>,
    text: String,
    stop_reason: Option<StopReason>,
    usage: TokenUsage,
    /// Prefill withheld from the request, prepended to the first text
    /// block.
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
                if let Ok(event) = serde_json::from_str::<SseEvent>(data) {
                    items.extend(self.handle_event(event));
                    if self.done {
                        break;
                    }
                }
            }
        }
        items
    }

    /// The terminal item for a stream that ended without `message_stop`.
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

    fn handle_event(&mut self, event: SseEvent) -> Vec<StreamItem> {
        match event {
            SseEvent::MessageStart { message } => message
                .usage
                .map(|usage| self.record_usage(&usage))
                .into_iter()
                .collect(),
            SseEvent::ContentBlockStart {
                index,
                content_block,
            } => self.handle_block_start(index, content_block),
            SseEvent::ContentBlockDelta { index, delta } => self.handle_block_delta(index, delta),
            SseEvent::ContentBlockStop { index } => self.handle_block_stop(index),
            SseEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.stop_reason = Some(convert_stop_reason(reason));
                }
                usage
                    .map(|usage| self.record_usage(&usage))
                    .into_iter()
                    .collect()
            }
            SseEvent::MessageStop => {
                self.done = true;
                vec![StreamItem::Done(self.build_result(None))]
            }
            SseEvent::Error { error } => vec![self.fail(StreamError {
                message: error.message,
                status: None,
            })],
            SseEvent::Ping | SseEvent::Unknown => Vec::new(),
        }
    }

    fn handle_block_start(&mut self, index: u32, block: ContentBlockStart) -> Vec<StreamItem> {
        match block.block_type.as_str() {
            "text" => {
                self.blocks.insert(index, BlockKind::Text);
                self.native
                    .insert(index, json!({"type": "text", "text": ""}));
                let mut items = vec![StreamItem::Chunk(StreamChunk::ContentStart)];
                if let Some(prefill) = self.prefill.take() {
                    self.append_text(index, &prefill);
                    items.push(StreamItem::Chunk(StreamChunk::ContentDelta {
                        text: prefill,
                    }));
                }
                items
            }
            "thinking" => {
                self.blocks.insert(index, BlockKind::Thinking);
                self.native.insert(
                    index,
                    json!({"type": "thinking", "thinking": "", "signature": ""}),
                );
                vec![StreamItem::Chunk(StreamChunk::ThinkingStart)]
            }
            "tool_use" => {
                self.blocks.insert(
                    index,
                    BlockKind::ToolUse {
                        id: block.id.unwrap_or_default(),
                        name: block.name.unwrap_or_default(),
                        json_buf: String::new(),
                    },
                );
                Vec::new()
            }
            "server_tool_use" => {
                let id = block.id.unwrap_or_default();
                match block.name.as_deref() {
                    Some("web_fetch") => {
                        self.blocks.insert(
                            index,
                            BlockKind::WebFetch {
                                id: id.clone(),
                                json_buf: String::new(),
                            },
                        );
                        vec![StreamItem::Chunk(StreamChunk::WebFetchStart {
                            id,
                            url: String::new(),
                        })]
                    }
                    // web_search and future server tools that stream a
                    // query-shaped input
                    _ => {
                        self.blocks.insert(
                            index,
                            BlockKind::WebSearch {
                                id: id.clone(),
                                json_buf: String::new(),
                            },
                        );
                        vec![StreamItem::Chunk(StreamChunk::WebSearchStart {
                            id,
                            query: String::new(),
                        })]
                    }
                }
            }
            "web_search_tool_result" => {
                self.blocks.insert(index, BlockKind::Other);
                let id = block.tool_use_id.unwrap_or_default();
                let content = block.content.unwrap_or(Value::Null);
                self.native.insert(
                    index,
                    json!({
                        "type": "web_search_tool_result",
                        "tool_use_id": id,
                        "content": content,
                    }),
                );
                let results = parse_search_results(&self.native[&index]["content"]);
                vec![StreamItem::Chunk(StreamChunk::WebSearchResult {
                    id,
                    results,
                })]
            }
            "web_fetch_tool_result" => {
                self.blocks.insert(index, BlockKind::Other);
                let id = block.tool_use_id.unwrap_or_default();
                let content = block.content.unwrap_or(Value::Null);
                let url = content["url"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let title = content["content"]["title"]
                    .as_str()
                    .map(String::from);
                self.native.insert(
                    index,
                    json!({
                        "type": "web_fetch_tool_result",
                        "tool_use_id": id,
                        "content": content,
                    }),
                );
                vec![StreamItem::Chunk(StreamChunk::WebFetchResult {
                    id,
                    url,
                    title,
                })]
            }
            _ => {
                self.blocks.insert(index, BlockKind::Other);
                Vec::new()
            }
        }
    }

    fn handle_block_delta(&mut self, index: u32, delta: BlockDelta) -> Vec<StreamItem> {
        match delta {
            BlockDelta::TextDelta { text } => {
                self.append_text(index, &text);
                vec![StreamItem::Chunk(StreamChunk::ContentDelta { text })]
            }
            BlockDelta::ThinkingDelta { thinking } => {
                if let Some(Value::String(existing)) = self
                    .native
                    .get_mut(&index)
                    .map(|block| &mut block["thinking"])
                {
                    existing.push_str(&thinking);
                }
                vec![StreamItem::Chunk(StreamChunk::ThinkingDelta {
                    text: thinking,
                })]
            }
            BlockDelta::InputJsonDelta { partial_json } => {
                match self.blocks.get_mut(&index) {
                    Some(
                        BlockKind::ToolUse { json_buf, .. }
                        | BlockKind::WebSearch { json_buf, .. }
                        | BlockKind::WebFetch { json_buf, .. },
                    ) => json_buf.push_str(&partial_json),
                    _ => {}
                }
                Vec::new()
            }
            BlockDelta::SignatureDelta { signature } => {
                if let Some(Value::String(existing)) = self
                    .native
                    .get_mut(&index)
                    .map(|block| &mut block["signature"])
                {
                    existing.push_str(&signature);
                }
                Vec::new()
            }
            BlockDelta::CitationsDelta { citation } => {
                let converted = Citation {
                    url: citation.url.unwrap_or_default(),
                    title: citation.title.unwrap_or_default(),
                    cited_text: citation.cited_text,
                };
                if let Some(block) = self.native.get_mut(&index) {
                    let citations = &mut block["citations"];
                    if citations.is_null() {
                        *citations = json!([]);
                    }
                    if let Some(list) = citations.as_array_mut() {
                        list.push(json!({
                            "url": converted.url,
                            "title": converted.title,
                            "cited_text": converted.cited_text,
                        }));
                    }
                }
                vec![StreamItem::Chunk(StreamChunk::Citation(converted))]
            }
            BlockDelta::Unknown => Vec::new(),
        }
    }

    fn handle_block_stop(&mut self, index: u32) -> Vec<StreamItem> {
        match self.blocks.remove(&index) {
            Some(BlockKind::Text) => vec![StreamItem::Chunk(StreamChunk::ContentEnd)],
            Some(BlockKind::Thinking) => vec![StreamItem::Chunk(StreamChunk::ThinkingEnd)],
            Some(BlockKind::ToolUse { id, name, json_buf }) => {
                let input = parse_input_json(&json_buf);
                self.native.insert(
                    index,
                    json!({"type": "tool_use", "id": id, "name": name, "input": input}),
                );
                vec![StreamItem::Chunk(StreamChunk::ToolUse(ToolUseBlock {
                    id,
                    name,
                    input,
                }))]
            }
            Some(BlockKind::WebSearch { id, json_buf }) => {
                let input = parse_input_json(&json_buf);
                self.native.insert(
                    index,
                    json!({
                        "type": "server_tool_use",
                        "id": id,
                        "name": "web_search",
                        "input": input,
                    }),
                );
                let query = input["query"].as_str().unwrap_or_default().to_string();
                if query.is_empty() {
                    Vec::new()
                } else {
                    vec![StreamItem::Chunk(StreamChunk::WebSearchDelta {
                        id,
                        delta: query,
                    })]
                }
            }
            Some(BlockKind::WebFetch { id, json_buf }) => {
                let input = parse_input_json(&json_buf);
                self.native.insert(
                    index,
                    json!({
                        "type": "server_tool_use",
                        "id": id,
                        "name": "web_fetch",
                        "input": input,
                    }),
                );
                let url = input["url"].as_str().unwrap_or_default().to_string();
                if url.is_empty() {
                    Vec::new()
                } else {
                    vec![StreamItem::Chunk(StreamChunk::WebFetchDelta {
                        id,
                        delta: url,
                    })]
                }
            }
            Some(BlockKind::Other) | None => Vec::new(),
        }
    }

    fn append_text(&mut self, index: u32, text: &str) {
        self.text.push_str(text);
        if let Some(Value::String(existing)) =
            self.native.get_mut(&index).map(|block| &mut block["text"])
        {
            existing.push_str(text);
        }
    }

    /// Folds a usage report in. Anthropic reports cumulative counts, so
    /// fields take the maximum rather than summing.
    fn record_usage(&mut self, usage: &ResponseUsage) -> StreamItem {
        let report = TokenUsage {
            input_tokens: usage.input_tokens.unwrap_or(0),
            output_tokens: usage.output_tokens.unwrap_or(0),
            reasoning_tokens: None,
            cache_creation_tokens: usage.cache_creation_input_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
        };
        self.usage.input_tokens = self.usage.input_tokens.max(report.input_tokens);
        self.usage.output_tokens = self.usage.output_tokens.max(report.output_tokens);
        if report.cache_creation_tokens.is_some() {
            self.usage.cache_creation_tokens = report.cache_creation_tokens;
        }
        if report.cache_read_tokens.is_some() {
            self.usage.cache_read_tokens = report.cache_read_tokens;
        }
        StreamItem::Chunk(StreamChunk::TokenUsage(report))
    }

    fn build_result(&mut self, error: Option<StreamError>) -> StreamResult {
        // A withheld prefill still belongs to the reply even if no text
        // block ever opened.
        let mut text = self.text.clone();
        if let Some(prefill) = self.prefill.take() {
            text = prefill + &text;
        }
        let native = if self.native.is_empty() {
            None
        } else {
            Some(Value::Array(self.native.values().cloned().collect()))
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

fn parse_input_json(buf: &str) -> Value {
    if buf.is_empty() {
        // Empty input means an argument-less call; the API expects {}.
        json!({})
    } else {
        serde_json::from_str(buf).unwrap_or_else(|_| json!({}))
    }
}

fn parse_search_results(content: &Value) -> Vec<SearchResult> {
    content
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let url = entry["url"].as_str()?;
                    Some(SearchResult {
                        url: url.to_string(),
                        title: entry["title"].as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn convert_stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        // end_turn and unknown values
        _ => StopReason::EndTurn,
    }
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
