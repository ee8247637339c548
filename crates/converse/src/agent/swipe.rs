//! History compaction for long conversations.
//!
//! Old rounds carry dead weight on every request: reasoning text the
//! provider ignores on resubmission, and tool results that were only
//! relevant when the model first read them. [`compact_messages`] strips
//! the weight from everything except the most recent rounds, keeping
//! every `tool_use`/`tool_result` pair intact so providers accept the
//! conversation.

use serde_json::Value;

use crate::content::RenderingContentBlock;
use crate::message::{Message, Role};

/// Rounds (assistant turns and everything after them) left untouched at
/// the end of the conversation.
pub const KEEP_RECENT_ROUNDS: usize = 2;

/// Tool-result texts longer than this are truncated in compacted
/// rounds.
pub const TOOL_RESULT_TRUNCATE_LEN: usize = 1_000;

const TRUNCATION_MARKER: &str = "… [truncated]";

/// A copy of the conversation with old rounds slimmed down.
///
/// Messages belonging to the last [`KEEP_RECENT_ROUNDS`] assistant
/// turns pass through untouched. In everything older:
///
/// - thinking entries are removed from native content and rendering
///   groups;
/// - tool-result texts longer than [`TOOL_RESULT_TRUNCATE_LEN`] are
///   cut, in both representations;
/// - `tool_use` and `tool_result` blocks themselves always survive, so
///   the call/result pairing the providers validate is preserved.
///
/// Native content that is not a JSON array is passed through verbatim —
/// the core does not guess at provider-specific shapes.
pub fn compact_messages(messages: &[Message]) -> Vec<Message> {
    let protected_from = protected_start(messages);
    messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            if index >= protected_from {
                message.clone()
            } else {
                compact_one(message)
            }
        })
        .collect()
}

/// Index of the first message in the protected tail.
fn protected_start(messages: &[Message]) -> usize {
    let mut assistants_seen = 0;
    for (index, message) in messages.iter().enumerate().rev() {
        if message.role == Role::Assistant {
            assistants_seen += 1;
            if assistants_seen == KEEP_RECENT_ROUNDS {
                return index;
            }
        }
    }
    0
}

fn compact_one(message: &Message) -> Message {
    let mut compacted = message.clone();

    if let Some(Value::Array(entries)) = compacted.content.native_content.take() {
        let kept: Vec<Value> = entries
            .into_iter()
            .filter(|entry| entry["type"] != "thinking")
            .map(truncate_native_tool_result)
            .collect();
        compacted.content.native_content = Some(Value::Array(kept));
    } else {
        compacted.content.native_content = message.content.native_content.clone();
    }

    if let Some(groups) = compacted.content.rendering_content.as_mut() {
        for group in groups.iter_mut() {
            group.blocks.retain(|block| {
                !matches!(block, RenderingContentBlock::Thinking { .. })
            });
            for block in group.blocks.iter_mut() {
                if let RenderingContentBlock::ToolResult(result) = block {
                    truncate_in_place(&mut result.content);
                }
            }
        }
        groups.retain(|group| !group.blocks.is_empty());
    }

    compacted
}

fn truncate_native_tool_result(mut entry: Value) -> Value {
    if entry["type"] == "tool_result" {
        if let Some(content) = entry.get("content").and_then(Value::as_str) {
            let mut text = content.to_string();
            if truncate_in_place(&mut text) {
                entry["content"] = Value::String(text);
            }
        }
    }
    entry
}

/// Truncates at a char boundary; returns whether anything was cut.
fn truncate_in_place(text: &mut String) -> bool {
    if text.chars().count() <= TOOL_RESULT_TRUNCATE_LEN {
        return false;
    }
    let cut: String = text.chars().take(TOOL_RESULT_TRUNCATE_LEN).collect();
    *text = cut + TRUNCATION_MARKER;
    true
}
