//! Render-ready content blocks and block groups.
//!
//! A streamed assistant turn is assembled into a flat list of
//! [`RenderingContentBlock`]s, which the UI consumes grouped into
//! [`RenderingBlockGroup`]s. Grouping follows one rule: consecutive
//! blocks of the same [`BlockCategory`] are coalesced into a single
//! group. Reply text and "backstage" activity (reasoning, tool calls,
//! web search/fetch) occupy different categories, so they never share
//! a group.
//!
//! During streaming the blocks are mutable accumulators owned by the
//! [`ContentAssembler`](crate::assembler::ContentAssembler); once a
//! message is persisted its groups are immutable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    /// Provider-issued id correlating this call with its result.
    pub id: String,
    /// The name of the tool being called.
    pub name: String,
    /// Parsed JSON arguments for the call.
    pub input: Value,
}

/// The outcome of a tool invocation, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    /// The [`ToolUseBlock::id`] this result answers.
    pub tool_use_id: String,
    /// Textual result content.
    pub content: String,
    /// Whether the tool failed. Errors are fed back to the model so it
    /// can react, not raised to the caller.
    #[serde(default)]
    pub is_error: bool,
}

/// A source citation attached to streamed reply text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// URL of the cited source.
    pub url: String,
    /// Title of the cited source.
    pub title: String,
    /// The quoted span, when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cited_text: Option<String>,
}

impl Citation {
    /// Renders this citation as inline link markup appended to reply text.
    pub fn to_inline_markup(&self) -> String {
        format!(r#"<a href="{}" title="{}">src</a>"#, self.url, self.title)
    }
}

/// One hit returned by a server-side web search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// URL of the result.
    pub url: String,
    /// Title of the result page.
    pub title: String,
}

/// A single unit of renderable content within an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderingContentBlock {
    /// Visible reply text, with any inline citation markup already applied.
    Text {
        /// The accumulated text.
        text: String,
    },
    /// Chain-of-thought reasoning text.
    Thinking {
        /// The accumulated reasoning text.
        text: String,
    },
    /// A tool invocation requested by the model.
    ToolUse(ToolUseBlock),
    /// The result fed back for a tool invocation.
    ToolResult(ToolResultBlock),
    /// A server-side web search, mutated in place as results arrive.
    WebSearch {
        /// Provider-issued id correlating start and result events.
        id: String,
        /// The search query (may stream in incrementally).
        query: String,
        /// Results, empty until the `.result` event arrives.
        results: Vec<SearchResult>,
    },
    /// A server-side page fetch, mutated in place as the result arrives.
    WebFetch {
        /// Provider-issued id correlating start and result events.
        id: String,
        /// The fetched URL.
        url: String,
        /// Page title, once known.
        title: Option<String>,
    },
    /// A terminal error attached to the end of a partially streamed turn.
    Error {
        /// User-facing description of the failure.
        message: String,
    },
}

impl RenderingContentBlock {
    /// The display category this block belongs to.
    pub fn category(&self) -> BlockCategory {
        match self {
            Self::Text { .. } => BlockCategory::Text,
            Self::Error { .. } => BlockCategory::Error,
            _ => BlockCategory::Backstage,
        }
    }
}

/// Display category used to group blocks into layout runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    /// Primary reply text.
    Text,
    /// Non-primary content: reasoning, tool calls/results, web activity.
    Backstage,
    /// Terminal stream errors.
    Error,
}

/// A run of same-category blocks — the unit of display layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderingBlockGroup {
    /// The shared category of every block in this group.
    pub category: BlockCategory,
    /// The blocks, in arrival order.
    pub blocks: Vec<RenderingContentBlock>,
}

/// Appends `block` to `groups`, coalescing into the trailing group when
/// the category matches. Returns the `(group, block)` indices where the
/// block now lives, so callers can keep handles for in-place mutation.
pub fn push_block(
    groups: &mut Vec<RenderingBlockGroup>,
    block: RenderingContentBlock,
) -> (usize, usize) {
    let category = block.category();
    match groups.last_mut() {
        Some(group) if group.category == category => {
            group.blocks.push(block);
            let block_index = group.blocks.len() - 1;
            (groups.len() - 1, block_index)
        }
        _ => {
            groups.push(RenderingBlockGroup {
                category,
                blocks: vec![block],
            });
            (groups.len() - 1, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RenderingContentBlock {
        RenderingContentBlock::Text { text: s.into() }
    }

    fn thinking(s: &str) -> RenderingContentBlock {
        RenderingContentBlock::Thinking { text: s.into() }
    }

    #[test]
    fn test_push_block_coalesces_same_category() {
        let mut groups = Vec::new();
        push_block(&mut groups, thinking("a"));
        push_block(
            &mut groups,
            RenderingContentBlock::ToolUse(ToolUseBlock {
                id: "t1".into(),
                name: "search".into(),
                input: serde_json::json!({}),
            }),
        );
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].category, BlockCategory::Backstage);
        assert_eq!(groups[0].blocks.len(), 2);
    }

    #[test]
    fn test_push_block_splits_on_category_change() {
        let mut groups = Vec::new();
        push_block(&mut groups, thinking("plan"));
        push_block(&mut groups, text("answer"));
        push_block(&mut groups, thinking("more"));
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].category, BlockCategory::Backstage);
        assert_eq!(groups[1].category, BlockCategory::Text);
        assert_eq!(groups[2].category, BlockCategory::Backstage);
    }

    #[test]
    fn test_push_block_returns_location() {
        let mut groups = Vec::new();
        let (g0, b0) = push_block(&mut groups, thinking("a"));
        let (g1, b1) = push_block(&mut groups, thinking("b"));
        assert_eq!((g0, b0), (0, 0));
        assert_eq!((g1, b1), (0, 1));
    }

    #[test]
    fn test_push_block_location_in_later_group() {
        let mut groups = Vec::new();
        push_block(&mut groups, text("hi"));
        push_block(&mut groups, thinking("a"));
        let (g, b) = push_block(&mut groups, thinking("b"));
        assert_eq!((g, b), (1, 1));
    }

    #[test]
    fn test_text_and_backstage_never_share_group() {
        let mut groups = Vec::new();
        push_block(&mut groups, text("hi"));
        push_block(&mut groups, thinking("hmm"));
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_citation_inline_markup() {
        let c = Citation {
            url: "https://example.com".into(),
            title: "Example".into(),
            cited_text: None,
        };
        assert_eq!(
            c.to_inline_markup(),
            r#"<a href="https://example.com" title="Example">src</a>"#
        );
    }

    #[test]
    fn test_block_serde_roundtrip() {
        let block = RenderingContentBlock::WebSearch {
            id: "srv-1".into(),
            query: "rust ownership".into(),
            results: vec![SearchResult {
                url: "https://doc.rust-lang.org".into(),
                title: "The Book".into(),
            }],
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains(r#""type":"web_search""#));
        let back: RenderingContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(block, back);
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(text("x").category(), BlockCategory::Text);
        assert_eq!(thinking("x").category(), BlockCategory::Backstage);
        assert_eq!(
            RenderingContentBlock::Error {
                message: "boom".into()
            }
            .category(),
            BlockCategory::Error
        );
        assert_eq!(
            RenderingContentBlock::ToolResult(ToolResultBlock {
                tool_use_id: "t".into(),
                content: "ok".into(),
                is_error: false,
            })
            .category(),
            BlockCategory::Backstage
        );
    }
}
