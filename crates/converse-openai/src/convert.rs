//! Request construction for the OpenAI Chat Completions API.
//!
//! Assistant turns resubmit the native message object captured during
//! streaming (content plus `tool_calls`), so tool invocations go back
//! exactly as the API produced them. Tool-result turns are expanded
//! into individual `role: "tool"` messages.

use converse::chunk::{StopReason, StreamError};
use converse::error::ChatError;
use converse::message::{Message, Role};
use converse::provider::StreamConfig;
use serde_json::{json, Value};

use crate::config::OpenAIConfig;
use crate::types::ErrorResponse;

// ── Request building ─────────────────────────────────────────────────

/// Builds the JSON body for a streaming chat-completions request.
///
/// Returns the body plus the withheld prefill, if any: in reasoning
/// mode a trailing assistant message is rejected, so the prefill is not
/// sent and the caller prepends it to the streamed output instead.
pub(crate) fn build_request(
    messages: &[Message],
    config: &OpenAIConfig,
    stream_cfg: &StreamConfig,
) -> Result<(Value, Option<String>), ChatError> {
    let mut api_messages = Vec::new();
    if let Some(system) = &stream_cfg.system {
        api_messages.push(json!({"role": "system", "content": system}));
    }
    convert_messages(messages, &mut api_messages);
    if api_messages.is_empty() {
        return Err(ChatError::InvalidRequest(
            "conversation has no sendable messages".into(),
        ));
    }

    let reasoning = stream_cfg.reasoning_budget.is_some();
    let mut withheld_prefill = None;
    if let Some(prefill) = &stream_cfg.prefill {
        if reasoning {
            withheld_prefill = Some(prefill.clone());
        } else {
            api_messages.push(json!({
                "role": "assistant",
                "content": prefill,
            }));
        }
    }

    let model = if stream_cfg.model.is_empty() {
        &config.model
    } else {
        &stream_cfg.model
    };
    let mut body = json!({
        "model": model,
        "messages": api_messages,
        "max_completion_tokens": stream_cfg.max_tokens.unwrap_or(config.max_tokens),
        "stream": true,
        "stream_options": {"include_usage": true},
    });

    // Reasoning models reject sampling parameters.
    if !reasoning {
        if let Some(temperature) = stream_cfg.temperature {
            body["temperature"] = json!(temperature);
        }
    }
    if let Some(budget) = stream_cfg.reasoning_budget {
        body["reasoning_effort"] = json!(effort_for_budget(budget));
    }

    if !stream_cfg.tools.is_empty() {
        let tools: Vec<Value> = stream_cfg
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    },
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    if stream_cfg.web_search {
        body["web_search_options"] = json!({});
    }

    Ok((body, withheld_prefill))
}

/// The chat-completions API expresses reasoning depth as an effort
/// level rather than a token budget.
fn effort_for_budget(budget: u32) -> &'static str {
    match budget {
        0..=4096 => "low",
        4097..=16384 => "medium",
        _ => "high",
    }
}

/// Appends API message objects for each conversation message, skipping
/// messages with nothing sendable.
fn convert_messages(messages: &[Message], out: &mut Vec<Value>) {
    for message in messages {
        match &message.content.native_content {
            // An assistant turn captured from a previous stream:
            // a partial message object with content and tool_calls.
            Some(Value::Object(native)) => {
                let mut api_message = json!({"role": role_str(message.role)});
                for (key, value) in native {
                    api_message[key.as_str()] = value.clone();
                }
                out.push(api_message);
            }
            // A tool-results turn: one `role: "tool"` message per entry.
            Some(Value::Array(entries)) => {
                for entry in entries {
                    if entry["type"] != "tool_result" {
                        continue;
                    }
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": entry["tool_use_id"],
                        "content": entry["content"],
                    }));
                }
            }
            _ => {
                if message.content.text.is_empty() {
                    continue;
                }
                out.push(json!({
                    "role": role_str(message.role),
                    "content": message.content.text,
                }));
            }
        }
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Maps a `finish_reason` string to the canonical stop reason.
pub(crate) fn convert_stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_calls" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        // stop, content_filter, and unknown values
        _ => StopReason::EndTurn,
    }
}

// ── Error conversion ─────────────────────────────────────────────────

/// Folds a non-2xx response into the stream-level error carried to the
/// caller through the terminal result.
pub(crate) fn convert_error(status: u16, body: &str) -> StreamError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map_or_else(|_| body.to_string(), |e| e.error.message);
    StreamError {
        message,
        status: Some(status),
    }
}

/// Extracts a stream error from a reqwest transport failure.
pub(crate) fn transport_error(err: &reqwest::Error) -> StreamError {
    StreamError {
        message: err.to_string(),
        status: err.status().map(|s| s.as_u16()),
    }
}
