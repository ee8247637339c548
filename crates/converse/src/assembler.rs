//! Streaming content assembly.
//!
//! [`ContentAssembler`] consumes the chunk protocol one event at a time
//! and maintains the [`RenderingBlockGroup`] list the UI renders
//! mid-stream. The same assembler state, finalized, becomes the
//! persisted `rendering_content` of the assistant message, so what the
//! user watched stream is exactly what gets stored.
//!
//! Behavioral rules, in rough order of subtlety:
//!
//! - Text and thinking blocks materialize lazily, on the first
//!   **non-empty** delta. A `start`/`end` pair with no text in between
//!   leaves no trace.
//! - A `content.start` arriving right after a text block closed reopens
//!   that block instead of creating a new one, unless any other block
//!   materialized in between. Usage reports, status events and buffered
//!   citations do not break the reopening chain; thinking never reopens.
//! - Deltas with no open block of their kind open one implicitly.
//! - Web search/fetch events address their block by provider id, with a
//!   fall-back to the most recent block of the same kind; events whose
//!   id matches nothing are dropped.
//! - Citations buffer until the surrounding text block closes, then
//!   flush as inline link markup appended to its text.

use std::collections::HashMap;

use crate::chunk::{StreamChunk, StreamError};
use crate::content::{
    push_block, Citation, RenderingBlockGroup, RenderingContentBlock, SearchResult,
};
use crate::usage::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Thinking,
    Content,
}

/// A block that has been started but may not have materialized yet.
#[derive(Debug, Clone)]
struct OpenBlock {
    kind: OpenKind,
    /// `(group, block)` indices once materialized.
    loc: Option<(usize, usize)>,
}

/// Stateful reducer from [`StreamChunk`]s to rendering block groups.
#[derive(Debug, Clone, Default)]
pub struct ContentAssembler {
    groups: Vec<RenderingBlockGroup>,
    open: Option<OpenBlock>,
    /// Reopening target for the next `content.start`.
    last_closed_text: Option<(usize, usize)>,
    /// Web search/fetch blocks addressable by provider id.
    web_blocks: HashMap<String, (usize, usize)>,
    pending_citations: Vec<Citation>,
    usage: TokenUsage,
    last_event: Option<String>,
}

impl ContentAssembler {
    /// A fresh assembler with no content.
    pub fn new() -> Self {
        Self::default()
    }

    /// The groups assembled so far. Valid to render at any point
    /// mid-stream.
    pub fn groups(&self) -> &[RenderingBlockGroup] {
        &self.groups
    }

    /// Token usage accumulated from `token_usage` chunks.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// The most recent provider status event, if any.
    pub fn last_event(&self) -> Option<&str> {
        self.last_event.as_deref()
    }

    /// Feeds one chunk into the assembler.
    pub fn push(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::ThinkingStart => self.open_block(OpenKind::Thinking),
            StreamChunk::ThinkingDelta { text } => self.append_delta(OpenKind::Thinking, &text),
            StreamChunk::ThinkingEnd => self.close_open(),

            StreamChunk::ContentStart => self.open_block(OpenKind::Content),
            StreamChunk::ContentDelta { text } => self.append_delta(OpenKind::Content, &text),
            StreamChunk::ContentEnd => self.close_open(),

            StreamChunk::ToolUse(block) => {
                push_block(&mut self.groups, RenderingContentBlock::ToolUse(block));
                self.last_closed_text = None;
            }

            StreamChunk::WebSearchStart { id, query } => {
                let loc = push_block(
                    &mut self.groups,
                    RenderingContentBlock::WebSearch {
                        id: id.clone(),
                        query,
                        results: Vec::new(),
                    },
                );
                self.last_closed_text = None;
                self.web_blocks.insert(id, loc);
            }
            StreamChunk::WebSearchDelta { id, delta } => {
                if let Some(RenderingContentBlock::WebSearch { query, .. }) =
                    self.web_block(&id, WebKind::Search)
                {
                    query.push_str(&delta);
                }
            }
            StreamChunk::WebSearchResult { id, results } => {
                self.set_search_results(&id, results);
            }

            StreamChunk::WebFetchStart { id, url } => {
                let loc = push_block(
                    &mut self.groups,
                    RenderingContentBlock::WebFetch {
                        id: id.clone(),
                        url,
                        title: None,
                    },
                );
                self.last_closed_text = None;
                self.web_blocks.insert(id, loc);
            }
            StreamChunk::WebFetchDelta { id, delta } => {
                if let Some(RenderingContentBlock::WebFetch { url, .. }) =
                    self.web_block(&id, WebKind::Fetch)
                {
                    url.push_str(&delta);
                }
            }
            StreamChunk::WebFetchResult { id, url, title } => {
                if let Some(RenderingContentBlock::WebFetch {
                    url: block_url,
                    title: block_title,
                    ..
                }) = self.web_block(&id, WebKind::Fetch)
                {
                    *block_url = url;
                    *block_title = title;
                }
            }

            StreamChunk::Citation(citation) => self.pending_citations.push(citation),
            StreamChunk::TokenUsage(usage) => self.usage += &usage,
            StreamChunk::Event { label } => self.last_event = Some(label),
        }
    }

    /// The final group list, with any open block closed and buffered
    /// citations flushed. Does not consume the assembler, so streaming
    /// snapshots and the persisted result come from the same state.
    pub fn finalize(&self) -> Vec<RenderingBlockGroup> {
        let mut done = self.clone();
        done.close_open();
        done.flush_trailing_citations();
        done.groups
    }

    /// Like [`finalize`](Self::finalize), with a terminal error block
    /// appended as its own group so partial output stays visible above
    /// the failure.
    pub fn finalize_with_error(&self, error: &StreamError) -> Vec<RenderingBlockGroup> {
        let mut done = self.clone();
        done.close_open();
        done.flush_trailing_citations();
        push_block(
            &mut done.groups,
            RenderingContentBlock::Error {
                message: error.message.clone(),
            },
        );
        done.groups
    }

    fn open_block(&mut self, kind: OpenKind) {
        if self.open.as_ref().is_some_and(|open| open.kind != kind) {
            self.close_open();
        }
        if self.open.is_none() {
            self.open = Some(OpenBlock { kind, loc: None });
        }
    }

    fn append_delta(&mut self, kind: OpenKind, text: &str) {
        self.open_block(kind);
        if text.is_empty() {
            return;
        }
        let loc = match self.open.as_ref().and_then(|open| open.loc) {
            Some(loc) => loc,
            None => self.materialize_open(kind),
        };
        if let RenderingContentBlock::Text { text: existing }
        | RenderingContentBlock::Thinking { text: existing } = self.block_at(loc)
        {
            existing.push_str(text);
        }
    }

    /// Creates (or, for text, reopens) the backing block for the
    /// currently open logical block.
    fn materialize_open(&mut self, kind: OpenKind) -> (usize, usize) {
        let loc = match kind {
            OpenKind::Content => match self.last_closed_text.take() {
                Some(loc) => loc,
                None => push_block(
                    &mut self.groups,
                    RenderingContentBlock::Text {
                        text: String::new(),
                    },
                ),
            },
            OpenKind::Thinking => {
                let loc = push_block(
                    &mut self.groups,
                    RenderingContentBlock::Thinking {
                        text: String::new(),
                    },
                );
                self.last_closed_text = None;
                loc
            }
        };
        if let Some(open) = self.open.as_mut() {
            open.loc = Some(loc);
        }
        loc
    }

    fn close_open(&mut self) {
        let Some(open) = self.open.take() else { return };
        if open.kind == OpenKind::Content {
            if let Some(loc) = open.loc {
                self.flush_citations_into(loc);
                self.last_closed_text = Some(loc);
            }
        }
    }

    fn flush_citations_into(&mut self, loc: (usize, usize)) {
        if self.pending_citations.is_empty() {
            return;
        }
        let citations = std::mem::take(&mut self.pending_citations);
        if let RenderingContentBlock::Text { text } = self.block_at(loc) {
            for citation in &citations {
                text.push_str(&citation.to_inline_markup());
            }
        }
    }

    /// Citations left over at end of stream attach to the last closed
    /// text block; with no text block to attach to, they are dropped.
    fn flush_trailing_citations(&mut self) {
        if let Some(loc) = self.last_closed_text {
            self.flush_citations_into(loc);
        }
    }

    fn block_at(&mut self, (group, block): (usize, usize)) -> &mut RenderingContentBlock {
        &mut self.groups[group].blocks[block]
    }

    fn web_block(&mut self, id: &str, kind: WebKind) -> Option<&mut RenderingContentBlock> {
        let loc = self
            .web_blocks
            .get(id)
            .copied()
            .or_else(|| self.last_web_block(kind))?;
        Some(self.block_at(loc))
    }

    fn set_search_results(&mut self, id: &str, results: Vec<SearchResult>) {
        if let Some(RenderingContentBlock::WebSearch {
            results: block_results,
            ..
        }) = self.web_block(id, WebKind::Search)
        {
            *block_results = results;
        }
    }

    fn last_web_block(&self, kind: WebKind) -> Option<(usize, usize)> {
        for (gi, group) in self.groups.iter().enumerate().rev() {
            for (bi, block) in group.blocks.iter().enumerate().rev() {
                let matches = match kind {
                    WebKind::Search => matches!(block, RenderingContentBlock::WebSearch { .. }),
                    WebKind::Fetch => matches!(block, RenderingContentBlock::WebFetch { .. }),
                };
                if matches {
                    return Some((gi, bi));
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum WebKind {
    Search,
    Fetch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{BlockCategory, ToolUseBlock};

    fn content(text: &str) -> StreamChunk {
        StreamChunk::ContentDelta { text: text.into() }
    }

    fn thinking(text: &str) -> StreamChunk {
        StreamChunk::ThinkingDelta { text: text.into() }
    }

    fn texts(groups: &[RenderingBlockGroup]) -> Vec<String> {
        groups
            .iter()
            .flat_map(|g| &g.blocks)
            .map(|b| match b {
                RenderingContentBlock::Text { text }
                | RenderingContentBlock::Thinking { text } => text.clone(),
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_deltas_accumulate_into_one_block() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ContentStart);
        asm.push(content("Hello"));
        asm.push(content(", world"));
        asm.push(StreamChunk::ContentEnd);
        let groups = asm.finalize();
        assert_eq!(groups.len(), 1);
        assert_eq!(texts(&groups), vec!["Hello, world"]);
    }

    #[test]
    fn test_empty_block_never_materializes() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ThinkingStart);
        asm.push(thinking(""));
        asm.push(StreamChunk::ThinkingEnd);
        asm.push(StreamChunk::ContentStart);
        asm.push(StreamChunk::ContentEnd);
        assert!(asm.finalize().is_empty());
    }

    #[test]
    fn test_orphan_delta_opens_block_implicitly() {
        let mut asm = ContentAssembler::new();
        asm.push(content("no start event"));
        let groups = asm.finalize();
        assert_eq!(texts(&groups), vec!["no start event"]);
    }

    #[test]
    fn test_content_start_reopens_last_text_block() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ContentStart);
        asm.push(content("first"));
        asm.push(StreamChunk::ContentEnd);
        asm.push(StreamChunk::TokenUsage(TokenUsage::default()));
        asm.push(StreamChunk::ContentStart);
        asm.push(content(" second"));
        asm.push(StreamChunk::ContentEnd);
        let groups = asm.finalize();
        assert_eq!(groups.len(), 1);
        assert_eq!(texts(&groups), vec!["first second"]);
    }

    #[test]
    fn test_reopening_broken_by_intervening_block() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ContentStart);
        asm.push(content("first"));
        asm.push(StreamChunk::ContentEnd);
        asm.push(StreamChunk::ToolUse(ToolUseBlock {
            id: "t1".into(),
            name: "lookup".into(),
            input: serde_json::json!({}),
        }));
        asm.push(StreamChunk::ContentStart);
        asm.push(content("second"));
        asm.push(StreamChunk::ContentEnd);
        let groups = asm.finalize();
        // Text, Backstage, Text.
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].category, BlockCategory::Text);
        assert_eq!(groups[1].category, BlockCategory::Backstage);
        assert_eq!(groups[2].category, BlockCategory::Text);
    }

    #[test]
    fn test_thinking_never_reopens() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ThinkingStart);
        asm.push(thinking("a"));
        asm.push(StreamChunk::ThinkingEnd);
        asm.push(StreamChunk::ThinkingStart);
        asm.push(thinking("b"));
        asm.push(StreamChunk::ThinkingEnd);
        let groups = asm.finalize();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].blocks.len(), 2);
    }

    #[test]
    fn test_citation_flushes_on_text_close() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ContentStart);
        asm.push(content("Paris is"));
        asm.push(StreamChunk::Citation(Citation {
            url: "https://wiki/paris".into(),
            title: "Paris".into(),
            cited_text: None,
        }));
        asm.push(StreamChunk::ContentEnd);
        let groups = asm.finalize();
        assert_eq!(
            texts(&groups),
            vec![r#"Paris is<a href="https://wiki/paris" title="Paris">src</a>"#]
        );
    }

    #[test]
    fn test_citation_does_not_break_reopening() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ContentStart);
        asm.push(content("a"));
        asm.push(StreamChunk::ContentEnd);
        asm.push(StreamChunk::Citation(Citation {
            url: "https://s".into(),
            title: "S".into(),
            cited_text: None,
        }));
        asm.push(StreamChunk::ContentStart);
        asm.push(content("b"));
        asm.push(StreamChunk::ContentEnd);
        let groups = asm.finalize();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].blocks.len(), 1);
    }

    #[test]
    fn test_web_search_lifecycle() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::WebSearchStart {
            id: "s1".into(),
            query: String::new(),
        });
        asm.push(StreamChunk::WebSearchDelta {
            id: "s1".into(),
            delta: "rust async".into(),
        });
        asm.push(StreamChunk::WebSearchResult {
            id: "s1".into(),
            results: vec![SearchResult {
                url: "https://tokio.rs".into(),
                title: "Tokio".into(),
            }],
        });
        let groups = asm.finalize();
        assert_eq!(groups.len(), 1);
        match &groups[0].blocks[0] {
            RenderingContentBlock::WebSearch { query, results, .. } => {
                assert_eq!(query, "rust async");
                assert_eq!(results.len(), 1);
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_web_event_with_unknown_id_ignored() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::WebSearchResult {
            id: "never-started".into(),
            results: vec![],
        });
        assert!(asm.finalize().is_empty());
    }

    #[test]
    fn test_web_result_falls_back_to_most_recent() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::WebFetchStart {
            id: "f1".into(),
            url: "https://a".into(),
        });
        asm.push(StreamChunk::WebFetchResult {
            id: "different-id".into(),
            url: "https://a/final".into(),
            title: Some("A".into()),
        });
        let groups = asm.finalize();
        match &groups[0].blocks[0] {
            RenderingContentBlock::WebFetch { url, title, .. } => {
                assert_eq!(url, "https://a/final");
                assert_eq!(title.as_deref(), Some("A"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_usage_and_event_observables() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::TokenUsage(TokenUsage {
            input_tokens: 10,
            ..Default::default()
        }));
        asm.push(StreamChunk::TokenUsage(TokenUsage {
            output_tokens: 4,
            ..Default::default()
        }));
        asm.push(StreamChunk::Event {
            label: "overloaded".into(),
        });
        assert_eq!(asm.usage().input_tokens, 10);
        assert_eq!(asm.usage().output_tokens, 4);
        assert_eq!(asm.last_event(), Some("overloaded"));
    }

    #[test]
    fn test_finalize_is_repeatable() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ContentStart);
        asm.push(content("partial"));
        let first = asm.finalize();
        let second = asm.finalize();
        assert_eq!(first, second);
        // The open block is still appendable afterwards.
        asm.push(content(" more"));
        assert_eq!(texts(&asm.finalize()), vec!["partial more"]);
    }

    #[test]
    fn test_finalize_with_error_appends_error_group() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ContentStart);
        asm.push(content("partial answer"));
        let groups = asm.finalize_with_error(&StreamError {
            message: "overloaded".into(),
            status: Some(529),
        });
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].category, BlockCategory::Error);
        assert_eq!(
            groups[1].blocks[0],
            RenderingContentBlock::Error {
                message: "overloaded".into()
            }
        );
    }

    #[test]
    fn test_mixed_stream_grouping() {
        let mut asm = ContentAssembler::new();
        asm.push(StreamChunk::ThinkingStart);
        asm.push(thinking("plan"));
        asm.push(StreamChunk::ThinkingEnd);
        asm.push(StreamChunk::ToolUse(ToolUseBlock {
            id: "t1".into(),
            name: "calc".into(),
            input: serde_json::json!({"expr": "1+1"}),
        }));
        asm.push(StreamChunk::ContentStart);
        asm.push(content("It is 2."));
        asm.push(StreamChunk::ContentEnd);
        let groups = asm.finalize();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].category, BlockCategory::Backstage);
        assert_eq!(groups[0].blocks.len(), 2);
        assert_eq!(groups[1].category, BlockCategory::Text);
    }
}
