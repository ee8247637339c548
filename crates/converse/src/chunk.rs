//! The canonical streaming protocol.
//!
//! Every provider normalizes its native wire events into a sequence of
//! [`StreamChunk`]s followed by exactly one terminal [`StreamResult`],
//! carried together as [`StreamItem`]s through a [`ChunkStream`].
//!
//! # Contract
//!
//! - Chunks for a logical block arrive in `start → delta* → end` order.
//!   Deltas outside an open block are treated by the assembler as an
//!   implicit start (or dropped, see
//!   [`ContentAssembler`](crate::assembler::ContentAssembler)).
//! - The stream **always completes** with a `Done` item, even on
//!   transport or auth failure — errors travel inside
//!   [`StreamResult::error`] rather than as stream items, so the caller
//!   can always persist a partial or error-tagged message.
//!
//! # Consuming a stream
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use converse::chunk::{ChunkStream, StreamItem};
//!
//! async fn drain(mut stream: ChunkStream) {
//!     while let Some(item) = stream.next().await {
//!         match item {
//!             StreamItem::Chunk(chunk) => println!("chunk: {chunk:?}"),
//!             StreamItem::Done(result) => println!("done: {:?}", result.stop_reason),
//!         }
//!     }
//! }
//! ```

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::{Citation, SearchResult, ToolUseBlock};
use crate::usage::TokenUsage;

/// A pinned, boxed, `Send` stream of [`StreamItem`]s.
///
/// Consume it with [`StreamExt`](futures::StreamExt) from the `futures`
/// crate.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

/// One item in a normalized provider stream: many chunks, then exactly
/// one terminal result.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// An incremental event.
    Chunk(StreamChunk),
    /// The terminal value. Always the last item of the stream.
    Done(StreamResult),
}

/// An incremental event in the normalized streaming protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum StreamChunk {
    /// A reasoning block opened.
    #[serde(rename = "thinking.start")]
    ThinkingStart,
    /// A fragment of reasoning text.
    #[serde(rename = "thinking")]
    ThinkingDelta {
        /// The text fragment.
        text: String,
    },
    /// The open reasoning block closed.
    #[serde(rename = "thinking.end")]
    ThinkingEnd,

    /// A reply-text block opened.
    #[serde(rename = "content.start")]
    ContentStart,
    /// A fragment of reply text.
    #[serde(rename = "content")]
    ContentDelta {
        /// The text fragment.
        text: String,
    },
    /// The open reply-text block closed.
    #[serde(rename = "content.end")]
    ContentEnd,

    /// A complete tool invocation. Emitted once per call, already
    /// assembled — there is no incremental tool-use delta at this layer.
    #[serde(rename = "tool_use")]
    ToolUse(ToolUseBlock),

    /// A server-side web search started.
    #[serde(rename = "web_search.start")]
    WebSearchStart {
        /// Provider-issued id correlating later events.
        id: String,
        /// The query, possibly empty until deltas arrive.
        query: String,
    },
    /// Incremental web-search query text.
    #[serde(rename = "web_search")]
    WebSearchDelta {
        /// Id of the originating search.
        id: String,
        /// Query fragment to append.
        delta: String,
    },
    /// Results for a previously started web search.
    #[serde(rename = "web_search.result")]
    WebSearchResult {
        /// Id of the originating search.
        id: String,
        /// The result set.
        results: Vec<SearchResult>,
    },

    /// A server-side page fetch started.
    #[serde(rename = "web_fetch.start")]
    WebFetchStart {
        /// Provider-issued id correlating later events.
        id: String,
        /// The URL, possibly empty until deltas arrive.
        url: String,
    },
    /// Incremental web-fetch URL text.
    #[serde(rename = "web_fetch")]
    WebFetchDelta {
        /// Id of the originating fetch.
        id: String,
        /// URL fragment to append.
        delta: String,
    },
    /// The outcome of a previously started page fetch.
    #[serde(rename = "web_fetch.result")]
    WebFetchResult {
        /// Id of the originating fetch.
        id: String,
        /// Final fetched URL.
        url: String,
        /// Page title, when known.
        title: Option<String>,
    },

    /// A source citation for the currently streaming text.
    #[serde(rename = "citation")]
    Citation(Citation),

    /// A token-usage report. May arrive more than once; counts are
    /// merged by the consumer.
    #[serde(rename = "token_usage")]
    TokenUsage(TokenUsage),

    /// A provider status event, surfaced as an observable label only.
    #[serde(rename = "event")]
    Event {
        /// Short human-readable label.
        label: String,
    },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn.
    EndTurn,
    /// The model wants tool results before continuing.
    ToolUse,
    /// The output-token ceiling was hit.
    MaxTokens,
    /// A configured stop sequence matched.
    StopSequence,
    /// The stream failed; see [`StreamResult::error`].
    Error,
}

/// A terminal stream failure, carried as data so the stream itself
/// always completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    /// User-facing description of the failure.
    pub message: String,
    /// HTTP status code, when one was received.
    pub status: Option<u16>,
}

/// The terminal value of a normalized provider stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    /// The full reply text (deltas concatenated, prefill included).
    pub text_content: String,
    /// The provider-native content for exact resubmission, opaque to
    /// the core.
    pub native_content: Option<Value>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token accounting for this call.
    pub usage: TokenUsage,
    /// Set when the stream terminated abnormally. The surrounding
    /// fields still describe whatever partial output was produced.
    pub error: Option<StreamError>,
}

impl StreamResult {
    /// An empty result that stopped for the given reason.
    pub fn empty(stop_reason: StopReason) -> Self {
        Self {
            text_content: String::new(),
            native_content: None,
            stop_reason,
            usage: TokenUsage::default(),
            error: None,
        }
    }

    /// A result representing a terminal failure with no usable output.
    pub fn from_error(error: StreamError) -> Self {
        Self {
            text_content: String::new(),
            native_content: None,
            stop_reason: StopReason::Error,
            usage: TokenUsage::default(),
            error: Some(error),
        }
    }

    /// The synthetic result used when a stream ends without yielding a
    /// terminal value. Always persisted so the conversation is never
    /// silently truncated.
    pub fn missing() -> Self {
        Self::from_error(StreamError {
            message: "stream returned no result".into(),
            status: None,
        })
    }
}

/// Builds a one-item stream that immediately completes with an error
/// result. Providers use this when request construction or connection
/// setup fails before any bytes arrive.
pub fn error_stream(error: StreamError) -> ChunkStream {
    Box::pin(futures::stream::iter([StreamItem::Done(
        StreamResult::from_error(error),
    )]))
}
