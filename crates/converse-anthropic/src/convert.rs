//! Request construction for the Anthropic Messages API.
//!
//! Conversation messages go out as their provider-native block arrays
//! whenever one was captured, so thinking signatures, tool calls and
//! server-tool blocks are resubmitted exactly as the API produced them.
//! Plain messages fall back to string content.

use converse::chunk::StreamError;
use converse::error::ChatError;
use converse::message::{Message, Role};
use converse::provider::StreamConfig;
use serde_json::{json, Value};

use crate::config::AnthropicConfig;
use crate::types::ErrorResponse;

/// How many messages, newest first, get a `cache_control` breakpoint.
const CACHE_BREAKPOINTS: usize = 2;

// ── Request building ─────────────────────────────────────────────────

/// Builds the JSON body for a streaming messages request.
///
/// Returns the body plus the withheld prefill, if any: with extended
/// thinking enabled the API rejects a trailing assistant message, so
/// the prefill is not sent and the caller prepends it to the streamed
/// output instead.
pub(crate) fn build_request(
    messages: &[Message],
    config: &AnthropicConfig,
    stream_cfg: &StreamConfig,
) -> Result<(Value, Option<String>), ChatError> {
    let mut api_messages = convert_messages(messages);
    if api_messages.is_empty() {
        return Err(ChatError::InvalidRequest(
            "conversation has no sendable messages".into(),
        ));
    }

    let thinking = stream_cfg.reasoning_budget.is_some();
    let mut withheld_prefill = None;
    if let Some(prefill) = &stream_cfg.prefill {
        if thinking {
            withheld_prefill = Some(prefill.clone());
        } else {
            api_messages.push(json!({
                "role": "assistant",
                "content": prefill,
            }));
        }
    }

    annotate_cache_breakpoints(&mut api_messages);

    let model = if stream_cfg.model.is_empty() {
        &config.model
    } else {
        &stream_cfg.model
    };
    let mut body = json!({
        "model": model,
        "messages": api_messages,
        "max_tokens": stream_cfg.max_tokens.unwrap_or(config.max_tokens),
        "stream": true,
    });

    if let Some(system) = &stream_cfg.system {
        body["system"] = json!(system);
    }
    // The API rejects temperature together with thinking.
    if !thinking {
        if let Some(temperature) = stream_cfg.temperature {
            body["temperature"] = json!(temperature);
        }
    }
    if let Some(budget) = stream_cfg.reasoning_budget {
        body["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": budget,
        });
    }

    let mut tools: Vec<Value> = stream_cfg
        .tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.parameters,
            })
        })
        .collect();
    if stream_cfg.web_search {
        tools.push(json!({
            "type": "web_search_20250305",
            "name": "web_search",
            "max_uses": 5,
        }));
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }

    Ok((body, withheld_prefill))
}

/// Converts conversation messages to API message objects, preferring
/// captured native content. Messages with nothing sendable are skipped.
fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .filter_map(|message| {
            let role = match message.role {
                Role::Assistant => "assistant",
                Role::User => "user",
            };
            let content = match &message.content.native_content {
                Some(native) => {
                    let mut native = native.clone();
                    strip_citations(&mut native);
                    native
                }
                None if message.content.text.is_empty() => return None,
                None => Value::String(message.content.text.clone()),
            };
            Some(json!({ "role": role, "content": content }))
        })
        .collect()
}

/// Removes `citations` fields from resubmitted text blocks. Citations
/// are display metadata; the API rejects them on requests that don't
/// enable the originating tool.
fn strip_citations(content: &mut Value) {
    if let Value::Array(blocks) = content {
        for block in blocks {
            if block["type"] == "text" {
                if let Some(obj) = block.as_object_mut() {
                    obj.remove("citations");
                }
            }
        }
    }
}

/// Marks the newest [`CACHE_BREAKPOINTS`] eligible messages with an
/// ephemeral `cache_control` on their last content block, so the
/// conversation prefix is cached across rounds.
///
/// Eligibility: the message must end in a block that can carry the
/// annotation — thinking blocks cannot, and messages that already carry
/// one are skipped without spending a slot. String content is promoted
/// to a one-block array to take the annotation.
fn annotate_cache_breakpoints(api_messages: &mut [Value]) {
    let mut remaining = CACHE_BREAKPOINTS;
    for message in api_messages.iter_mut().rev() {
        if remaining == 0 {
            break;
        }
        match &mut message["content"] {
            Value::String(text) => {
                let text = std::mem::take(text);
                message["content"] = json!([{
                    "type": "text",
                    "text": text,
                    "cache_control": {"type": "ephemeral"},
                }]);
                remaining -= 1;
            }
            Value::Array(blocks) => {
                let Some(last) = blocks.last_mut().and_then(Value::as_object_mut) else {
                    continue;
                };
                if last.get("type").and_then(Value::as_str) == Some("thinking") {
                    continue;
                }
                if last.contains_key("cache_control") {
                    continue;
                }
                last.insert("cache_control".into(), json!({"type": "ephemeral"}));
                remaining -= 1;
            }
            _ => {}
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> StreamConfig {
        StreamConfig {
            model: "claude-sonnet-4-20250514".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_request_minimal() {
        let messages = vec![Message::user("Hello")];
        let (body, withheld) =
            build_request(&messages, &AnthropicConfig::default(), &cfg()).unwrap();

        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(withheld.is_none());
        assert!(body.get("tools").is_none());
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn test_empty_conversation_rejected() {
        let err = build_request(&[], &AnthropicConfig::default(), &cfg()).unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
    }

    #[test]
    fn test_prefill_sent_as_trailing_assistant() {
        let messages = vec![Message::user("Hello")];
        let config = StreamConfig {
            prefill: Some("{\"answer\":".into()),
            ..cfg()
        };
        let (body, withheld) =
            build_request(&messages, &AnthropicConfig::default(), &config).unwrap();

        assert!(withheld.is_none());
        let api_messages = body["messages"].as_array().unwrap();
        let last = api_messages.last().unwrap();
        assert_eq!(last["role"], "assistant");
    }

    #[test]
    fn test_prefill_withheld_under_thinking() {
        let messages = vec![Message::user("Hello")];
        let config = StreamConfig {
            prefill: Some("Sure:".into()),
            reasoning_budget: Some(2048),
            ..cfg()
        };
        let (body, withheld) =
            build_request(&messages, &AnthropicConfig::default(), &config).unwrap();

        assert_eq!(withheld.as_deref(), Some("Sure:"));
        let api_messages = body["messages"].as_array().unwrap();
        assert_eq!(api_messages.last().unwrap()["role"], "user");
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
    }

    #[test]
    fn test_temperature_omitted_under_thinking() {
        let messages = vec![Message::user("Hello")];
        let config = StreamConfig {
            temperature: Some(0.7),
            reasoning_budget: Some(1024),
            ..cfg()
        };
        let (body, _) = build_request(&messages, &AnthropicConfig::default(), &config).unwrap();
        assert!(body.get("temperature").is_none());

        let config = StreamConfig {
            temperature: Some(0.7),
            ..cfg()
        };
        let (body, _) = build_request(&messages, &AnthropicConfig::default(), &config).unwrap();
        assert_eq!(body["temperature"], 0.7);
    }

    #[test]
    fn test_web_search_tool_injected() {
        let messages = vec![Message::user("What's new?")];
        let config = StreamConfig {
            web_search: true,
            ..cfg()
        };
        let (body, _) = build_request(&messages, &AnthropicConfig::default(), &config).unwrap();
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools[0]["type"], "web_search_20250305");
        assert_eq!(tools[0]["name"], "web_search");
    }

    #[test]
    fn test_cache_breakpoints_limited_to_two() {
        let messages: Vec<Message> = (0..5).map(|i| Message::user(format!("msg {i}"))).collect();
        let (body, _) = build_request(&messages, &AnthropicConfig::default(), &cfg()).unwrap();

        let annotated: usize = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|message| {
                message["content"]
                    .as_array()
                    .is_some_and(|blocks| blocks.last().unwrap().get("cache_control").is_some())
            })
            .count();
        assert_eq!(annotated, 2);

        // The two newest messages carry the breakpoints.
        let api_messages = body["messages"].as_array().unwrap();
        assert!(api_messages[4]["content"][0]["cache_control"].is_object());
        assert!(api_messages[3]["content"][0]["cache_control"].is_object());
        assert!(api_messages[2]["content"].is_string());
    }

    #[test]
    fn test_thinking_tail_skipped_for_cache_breakpoint() {
        let mut assistant = Message::user("placeholder");
        assistant.role = Role::Assistant;
        assistant.content.native_content = Some(json!([
            {"type": "thinking", "thinking": "hmm", "signature": "sig"},
        ]));
        let messages = vec![Message::user("one"), assistant, Message::user("two")];
        let (body, _) = build_request(&messages, &AnthropicConfig::default(), &cfg()).unwrap();

        let api_messages = body["messages"].as_array().unwrap();
        // The thinking-tailed message is skipped; breakpoints land on
        // the surrounding user messages.
        assert!(api_messages[1]["content"][0].get("cache_control").is_none());
        assert!(api_messages[0]["content"][0]["cache_control"].is_object());
        assert!(api_messages[2]["content"][0]["cache_control"].is_object());
    }

    #[test]
    fn test_preannotated_message_does_not_spend_a_breakpoint() {
        let mut tail = Message::user("cached already");
        tail.content.native_content = Some(json!([
            {"type": "text", "text": "cached already", "cache_control": {"type": "ephemeral"}},
        ]));
        let messages = vec![Message::user("one"), Message::user("two"), tail];
        let (body, _) = build_request(&messages, &AnthropicConfig::default(), &cfg()).unwrap();

        // Both fresh annotations land on the older messages.
        let api_messages = body["messages"].as_array().unwrap();
        assert!(api_messages[2]["content"][0]["cache_control"].is_object());
        assert!(api_messages[1]["content"][0]["cache_control"].is_object());
        assert!(api_messages[0]["content"][0]["cache_control"].is_object());
    }

    #[test]
    fn test_citations_stripped_from_native_content() {
        let mut assistant = Message::user("placeholder");
        assistant.role = Role::Assistant;
        assistant.content.native_content = Some(json!([
            {"type": "text", "text": "Paris is", "citations": [{"url": "https://x"}]},
        ]));
        let messages = vec![Message::user("capital?"), assistant, Message::user("more")];
        let (body, _) = build_request(&messages, &AnthropicConfig::default(), &cfg()).unwrap();

        let blocks = body["messages"][1]["content"].as_array().unwrap();
        assert!(blocks[0].get("citations").is_none());
        assert_eq!(blocks[0]["text"], "Paris is");
    }

    #[test]
    fn test_native_content_resubmitted_verbatim() {
        let tool_results = Message::tool_results(
            json!([{"type": "tool_result", "tool_use_id": "t1", "content": "42", "is_error": false}]),
            vec![],
        );
        let messages = vec![Message::user("q"), tool_results];
        let (body, _) = build_request(&messages, &AnthropicConfig::default(), &cfg()).unwrap();

        let content = &body["messages"][1]["content"];
        assert_eq!(content[0]["type"], "tool_result");
        assert_eq!(content[0]["tool_use_id"], "t1");
    }

    #[test]
    fn test_convert_error_parses_api_body() {
        let err = convert_error(
            429,
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#,
        );
        assert_eq!(err.message, "slow down");
        assert_eq!(err.status, Some(429));
    }

    #[test]
    fn test_convert_error_falls_back_to_raw_body() {
        let err = convert_error(502, "bad gateway");
        assert_eq!(err.message, "bad gateway");
    }
}
