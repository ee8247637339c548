//! Recovery for runs that ended with tool calls unanswered.
//!
//! When a run stops at the iteration cap (or the app restarts
//! mid-loop), the newest assistant message may carry `tool_use` blocks
//! with no matching `tool_result` — a conversation most providers will
//! reject on resubmission. [`unresolved_tool_calls`] detects the state
//! and [`resolve_pending`] repairs it, either by stopping (feeding the
//! model placeholder results so the user can decide what happens next)
//! or by executing the pending tools and resuming the loop.

use tracing::info;

use crate::content::{RenderingContentBlock, ToolResultBlock};
use crate::error::ChatError;
use crate::events::UiEvent;
use crate::message::{Message, Role};
use crate::tool::ToolOutcome;

use super::runner::{run_loop, tool_calls_of, tool_results_message};
use super::{AgentContext, LoopResult};

/// Placeholder fed to the model for each pending call when the user
/// chooses not to continue.
pub const STOPPED_RESULT_TEXT: &str = "Token limit reached, ask user to continue";

/// What to do about pending tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingResolution {
    /// Answer each pending call with a placeholder result and stop.
    Stop,
    /// Execute the pending tools and resume the loop.
    Continue,
}

/// The ids of tool calls in the newest assistant turn that have no
/// matching result yet. `None` when the conversation is consistent.
pub fn unresolved_tool_calls(messages: &[Message]) -> Option<Vec<String>> {
    let last_assistant = messages
        .iter()
        .rposition(|message| message.role == Role::Assistant)?;

    let calls = tool_calls_of(&messages[last_assistant]);
    if calls.is_empty() {
        return None;
    }

    let resolved: Vec<&str> = messages[last_assistant + 1..]
        .iter()
        .filter_map(|message| message.content.rendering_content.as_ref())
        .flat_map(|groups| groups.iter().flat_map(|group| &group.blocks))
        .filter_map(|block| match block {
            RenderingContentBlock::ToolResult(result) => Some(result.tool_use_id.as_str()),
            _ => None,
        })
        .collect();

    let unresolved: Vec<String> = calls
        .into_iter()
        .filter(|call| !resolved.contains(&call.id.as_str()))
        .map(|call| call.id)
        .collect();

    (!unresolved.is_empty()).then_some(unresolved)
}

/// Repairs a conversation with pending tool calls.
///
/// With [`PendingResolution::Stop`], each pending call gets a
/// placeholder result; the message is persisted and `Ok(None)` is
/// returned. With [`PendingResolution::Continue`], the pending tools
/// are executed and the loop resumes; the run's [`LoopResult`] is
/// returned. A context without pending calls is a no-op `Ok(None)`.
pub async fn resolve_pending(
    mut ctx: AgentContext,
    resolution: PendingResolution,
) -> Result<Option<LoopResult>, ChatError> {
    let Some(pending_ids) = unresolved_tool_calls(&ctx.messages) else {
        return Ok(None);
    };
    info!(pending = pending_ids.len(), ?resolution, "resolving pending tool calls");

    let last_assistant = ctx
        .messages
        .iter()
        .rposition(|message| message.role == Role::Assistant)
        .expect("unresolved calls imply an assistant message");
    let calls: Vec<_> = tool_calls_of(&ctx.messages[last_assistant])
        .into_iter()
        .filter(|call| pending_ids.contains(&call.id))
        .collect();

    match resolution {
        PendingResolution::Stop => {
            let outcomes: Vec<ToolOutcome> = calls
                .iter()
                .map(|call| ToolOutcome {
                    block: ToolResultBlock {
                        tool_use_id: call.id.clone(),
                        content: STOPPED_RESULT_TEXT.into(),
                        is_error: false,
                    },
                    extra_groups: Vec::new(),
                })
                .collect();
            let message = tool_results_message(&outcomes);
            ctx.store
                .save_message(ctx.chat.id, &message)
                .await
                .map_err(|err| ChatError::Storage(err.to_string()))?;
            ctx.events.emit(UiEvent::MessageAppended {
                message: message.clone(),
            });
            ctx.messages.push(message);
            ctx.sessions.dispose().await;
            Ok(None)
        }
        PendingResolution::Continue => {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in &calls {
                outcomes.push(
                    ctx.tools
                        .execute_call(call, &mut ctx.sessions, &ctx.events)
                        .await,
                );
            }
            let message = tool_results_message(&outcomes);
            ctx.store
                .save_message(ctx.chat.id, &message)
                .await
                .map_err(|err| ChatError::Storage(err.to_string()))?;
            ctx.events.emit(UiEvent::MessageAppended {
                message: message.clone(),
            });
            ctx.messages.push(message);
            Ok(Some(run_loop(ctx).await))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::content::{push_block, ToolUseBlock};
    use crate::message::{MessageContent, MessageMetadata};
    use crate::usage::{Cost, TokenUsage};

    fn assistant_with_calls(ids: &[&str]) -> Message {
        let mut groups = Vec::new();
        for id in ids {
            push_block(
                &mut groups,
                RenderingContentBlock::ToolUse(ToolUseBlock {
                    id: (*id).into(),
                    name: "lookup".into(),
                    input: json!({}),
                }),
            );
        }
        Message::assistant(
            MessageContent {
                rendering_content: Some(groups),
                ..Default::default()
            },
            MessageMetadata {
                usage: TokenUsage::default(),
                cost: Cost::ZERO,
                context_window_tokens: 0,
            },
        )
    }

    fn results_for(ids: &[&str]) -> Message {
        let outcomes: Vec<ToolOutcome> = ids
            .iter()
            .map(|id| ToolOutcome {
                block: ToolResultBlock {
                    tool_use_id: (*id).into(),
                    content: "ok".into(),
                    is_error: false,
                },
                extra_groups: Vec::new(),
            })
            .collect();
        tool_results_message(&outcomes)
    }

    #[test]
    fn test_detects_unresolved_calls() {
        let messages = vec![Message::user("hi"), assistant_with_calls(&["a", "b"])];
        assert_eq!(
            unresolved_tool_calls(&messages),
            Some(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_resolved_conversation_is_clean() {
        let messages = vec![
            Message::user("hi"),
            assistant_with_calls(&["a"]),
            results_for(&["a"]),
        ];
        assert_eq!(unresolved_tool_calls(&messages), None);
    }

    #[test]
    fn test_partial_resolution_detected() {
        let messages = vec![
            assistant_with_calls(&["a", "b"]),
            results_for(&["a"]),
        ];
        assert_eq!(unresolved_tool_calls(&messages), Some(vec!["b".into()]));
    }

    #[test]
    fn test_plain_conversation_has_no_pending() {
        let messages = vec![Message::user("hi")];
        assert_eq!(unresolved_tool_calls(&messages), None);
    }
}
