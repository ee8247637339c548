//! The loop engine.

use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::assembler::ContentAssembler;
use crate::chunk::{StopReason, StreamItem, StreamResult};
use crate::content::{push_block, RenderingBlockGroup, RenderingContentBlock, ToolUseBlock};
use crate::events::UiEvent;
use crate::message::{Message, MessageContent, MessageMetadata};
use crate::tool::ToolOutcome;
use crate::usage::{Cost, ModelPricing, TokenUsage};

use super::AgentContext;

/// Hard cap on model rounds per run. A run that still wants tools after
/// this many streams stops with [`LoopStatus::MaxIterations`] and
/// leaves its last tool calls unresolved (see
/// [`pending`](super::pending)).
pub const MAX_ITERATIONS: usize = 10;

/// How a loop run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStatus {
    /// The model finished its turn. Set even when the final stream
    /// carried an error: the error block was persisted and the
    /// conversation is in a consistent, resumable state.
    Complete {
        /// The final assistant text.
        return_value: String,
    },
    /// An unrecoverable failure, typically storage. The conversation
    /// may be missing its newest round.
    Error {
        /// What failed.
        message: String,
    },
    /// The iteration cap was hit with tool calls still pending.
    MaxIterations,
}

/// The outcome of one [`run_loop`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopResult {
    /// How the run ended.
    pub status: LoopStatus,
    /// The full conversation after the run.
    pub messages: Vec<Message>,
    /// Tokens consumed across every round of this run.
    pub usage: TokenUsage,
    /// Cost of this run.
    pub cost: Cost,
}

/// Runs the agent loop to completion.
///
/// Whatever happens inside — stream errors, storage failures, the
/// iteration cap — the tool session is disposed exactly once before
/// this returns.
#[instrument(skip_all, fields(chat = %ctx.chat.id, provider = %ctx.provider.metadata().name))]
pub async fn run_loop(mut ctx: AgentContext) -> LoopResult {
    let result = drive_rounds(&mut ctx).await;
    ctx.sessions.dispose().await;
    info!(status = ?result.status, "agent loop finished");
    LoopResult {
        status: result.status,
        messages: ctx.messages,
        usage: result.usage,
        cost: result.cost,
    }
}

struct RunOutcome {
    status: LoopStatus,
    usage: TokenUsage,
    cost: Cost,
}

async fn drive_rounds(ctx: &mut AgentContext) -> RunOutcome {
    let pricing = resolve_pricing(ctx).await;
    ctx.config.tools = ctx.tools.definitions();

    let mut run_usage = TokenUsage::default();
    let mut run_cost = Cost::ZERO;

    for iteration in 1..=MAX_ITERATIONS {
        debug!(iteration, "starting model round");
        ctx.events.emit(UiEvent::StreamingStart);

        let mut stream = if ctx.compact_history {
            let compacted = super::swipe::compact_messages(&ctx.messages);
            ctx.provider.stream_boxed(&compacted, &ctx.config).await
        } else {
            ctx.provider.stream_boxed(&ctx.messages, &ctx.config).await
        };

        let mut assembler = ContentAssembler::new();
        let mut terminal: Option<StreamResult> = None;
        while let Some(item) = stream.next().await {
            match item {
                StreamItem::Chunk(chunk) => {
                    assembler.push(chunk);
                    ctx.events.emit(UiEvent::GroupsUpdate {
                        groups: assembler.finalize(),
                    });
                }
                StreamItem::Done(result) => {
                    terminal = Some(result);
                    break;
                }
            }
        }
        let result = terminal.unwrap_or_else(|| {
            warn!("provider stream ended without a terminal result");
            StreamResult::missing()
        });
        ctx.events.emit(UiEvent::StreamingEnd);

        // Providers report usage either in the terminal result or as
        // chunks along the way; take whichever actually carried counts.
        let round_usage = if result.usage == TokenUsage::default() {
            assembler.usage()
        } else {
            result.usage
        };
        let round_cost = pricing.cost_of(&round_usage);
        run_usage += &round_usage;
        run_cost = run_cost.saturating_add(round_cost);

        let groups = match &result.error {
            Some(error) => assembler.finalize_with_error(error),
            None => assembler.finalize(),
        };
        let assistant = Message::assistant(
            MessageContent {
                text: result.text_content.clone(),
                native_content: result.native_content.clone(),
                rendering_content: Some(groups.clone()),
                stop_reason: Some(result.stop_reason),
            },
            MessageMetadata {
                usage: round_usage,
                cost: round_cost,
                context_window_tokens: round_usage.context_window_usage(),
            },
        );

        if let Err(err) = ctx.store.save_message(ctx.chat.id, &assistant).await {
            return RunOutcome {
                status: LoopStatus::Error {
                    message: format!("failed to persist assistant message: {err}"),
                },
                usage: run_usage,
                cost: run_cost,
            };
        }
        ctx.events.emit(UiEvent::MessageAppended {
            message: assistant.clone(),
        });
        ctx.messages.push(assistant);

        let stream_failed = result.error.is_some();
        let calls = tool_calls_of(ctx.messages.last().expect("just pushed"));
        // A tool-use stop with no extractable calls is terminal: there
        // is nothing to execute and no result to stream back, so
        // another round would only repeat the same turn.
        let wants_tools =
            !stream_failed && result.stop_reason == StopReason::ToolUse && !calls.is_empty();

        if wants_tools && iteration < MAX_ITERATIONS {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in &calls {
                outcomes.push(
                    ctx.tools
                        .execute_call(call, &mut ctx.sessions, &ctx.events)
                        .await,
                );
            }
            let results = tool_results_message(&outcomes);
            if let Err(err) = ctx.store.save_message(ctx.chat.id, &results).await {
                let status = LoopStatus::Error {
                    message: format!("failed to persist tool results: {err}"),
                };
                return RunOutcome {
                    status,
                    usage: run_usage,
                    cost: run_cost,
                };
            }
            ctx.events.emit(UiEvent::MessageAppended {
                message: results.clone(),
            });
            ctx.messages.push(results);
        }

        if let Err(err) = save_totals(ctx, &round_usage, round_cost).await {
            return RunOutcome {
                status: LoopStatus::Error {
                    message: format!("failed to persist chat totals: {err}"),
                },
                usage: run_usage,
                cost: run_cost,
            };
        }

        if !wants_tools {
            return RunOutcome {
                status: LoopStatus::Complete {
                    return_value: result.text_content,
                },
                usage: run_usage,
                cost: run_cost,
            };
        }
        if iteration == MAX_ITERATIONS {
            warn!("iteration cap reached with tool calls pending");
            return RunOutcome {
                status: LoopStatus::MaxIterations,
                usage: run_usage,
                cost: run_cost,
            };
        }
    }

    unreachable!("loop exits by return");
}

async fn resolve_pricing(ctx: &AgentContext) -> ModelPricing {
    match ctx.store.get_model(&ctx.chat.model).await {
        Ok(Some(info)) => info.pricing,
        Ok(None) => {
            warn!(model = %ctx.chat.model, "model not in catalog; costs will read zero");
            ModelPricing::default()
        }
        Err(err) => {
            warn!(model = %ctx.chat.model, %err, "model lookup failed; costs will read zero");
            ModelPricing::default()
        }
    }
}

async fn save_totals(
    ctx: &mut AgentContext,
    usage: &TokenUsage,
    cost: Cost,
) -> Result<(), crate::error::ChatError> {
    ctx.chat.totals.record(usage, cost);
    ctx.chat.updated_at = chrono::Utc::now();
    ctx.store.save_chat(&ctx.chat).await?;
    ctx.events.emit(UiEvent::ChatMetadataChanged {
        totals: ctx.chat.totals,
        context_window_tokens: Some(usage.context_window_usage()),
    });
    Ok(())
}

/// The tool calls an assistant message made, in block order.
pub(crate) fn tool_calls_of(message: &Message) -> Vec<ToolUseBlock> {
    let Some(groups) = &message.content.rendering_content else {
        return Vec::new();
    };
    groups
        .iter()
        .flat_map(|group| &group.blocks)
        .filter_map(|block| match block {
            RenderingContentBlock::ToolUse(call) => Some(call.clone()),
            _ => None,
        })
        .collect()
}

/// Builds the user message that carries tool outcomes back to the
/// model: native `tool_result` blocks for the provider, mirrored
/// rendering groups for display.
pub(crate) fn tool_results_message(outcomes: &[ToolOutcome]) -> Message {
    let native = outcomes
        .iter()
        .map(|outcome| {
            json!({
                "type": "tool_result",
                "tool_use_id": outcome.block.tool_use_id,
                "content": outcome.block.content,
                "is_error": outcome.block.is_error,
            })
        })
        .collect::<Vec<_>>();

    let mut rendering: Vec<RenderingBlockGroup> = Vec::new();
    for outcome in outcomes {
        push_block(
            &mut rendering,
            RenderingContentBlock::ToolResult(outcome.block.clone()),
        );
        rendering.extend(outcome.extra_groups.iter().cloned());
    }

    Message::tool_results(serde_json::Value::Array(native), rendering)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ToolResultBlock;

    #[test]
    fn test_tool_calls_of_extracts_in_order() {
        let mut groups = Vec::new();
        push_block(
            &mut groups,
            RenderingContentBlock::ToolUse(ToolUseBlock {
                id: "a".into(),
                name: "one".into(),
                input: json!({}),
            }),
        );
        push_block(
            &mut groups,
            RenderingContentBlock::Text {
                text: "between".into(),
            },
        );
        push_block(
            &mut groups,
            RenderingContentBlock::ToolUse(ToolUseBlock {
                id: "b".into(),
                name: "two".into(),
                input: json!({}),
            }),
        );
        let message = Message::assistant(
            MessageContent {
                rendering_content: Some(groups),
                ..Default::default()
            },
            MessageMetadata {
                usage: TokenUsage::default(),
                cost: Cost::ZERO,
                context_window_tokens: 0,
            },
        );
        let calls = tool_calls_of(&message);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[1].id, "b");
    }

    #[test]
    fn test_tool_results_message_shape() {
        let outcomes = vec![ToolOutcome {
            block: ToolResultBlock {
                tool_use_id: "a".into(),
                content: "42".into(),
                is_error: false,
            },
            extra_groups: Vec::new(),
        }];
        let message = tool_results_message(&outcomes);
        let native = message.content.native_content.unwrap();
        assert_eq!(native[0]["type"], "tool_result");
        assert_eq!(native[0]["tool_use_id"], "a");
        assert_eq!(native[0]["content"], "42");
        let rendering = message.content.rendering_content.unwrap();
        assert_eq!(rendering.len(), 1);
    }
}
