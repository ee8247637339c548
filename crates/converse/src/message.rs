//! Conversation messages.
//!
//! A [`Message`] carries three parallel views of the same turn:
//!
//! - `content.text` — plain text, the lowest common denominator;
//! - `content.native_content` — the provider's own JSON block list,
//!   kept opaque so a follow-up request can resubmit the turn exactly
//!   as the provider produced it (signatures, citations and all);
//! - `content.rendering_content` — the assembled display groups.
//!
//! The three are produced together when a stream finishes and are never
//! edited independently afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::chunk::StopReason;
use crate::content::RenderingBlockGroup;
use crate::usage::{Cost, TokenUsage};

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human (or the tool loop speaking on their behalf).
    User,
    /// The model.
    Assistant,
}

/// The content of a message, in its parallel representations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MessageContent {
    /// Plain reply text.
    pub text: String,
    /// Provider-native content blocks, opaque JSON resubmitted verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_content: Option<Value>,
    /// Assembled display groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendering_content: Option<Vec<RenderingBlockGroup>>,
    /// Why generation stopped, for assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

/// Accounting attached to an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Token usage of the call that produced this message.
    pub usage: TokenUsage,
    /// Cost of the call that produced this message.
    pub cost: Cost,
    /// Context-window occupancy after this call.
    pub context_window_tokens: u64,
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable unique id.
    pub id: Uuid,
    /// Who produced the message.
    pub role: Role,
    /// The message content in its parallel representations.
    pub content: MessageContent,
    /// Accounting, present on assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: MessageContent {
                text: text.into(),
                ..Default::default()
            },
            metadata: None,
            created_at: Utc::now(),
        }
    }

    /// An assistant message with the given content and metadata.
    pub fn assistant(content: MessageContent, metadata: MessageMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            content,
            metadata: Some(metadata),
            created_at: Utc::now(),
        }
    }

    /// A user message carrying native tool-result blocks back to the
    /// model. The plain text stays empty; providers read the native
    /// blocks.
    pub fn tool_results(native_content: Value, rendering: Vec<RenderingBlockGroup>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: MessageContent {
                text: String::new(),
                native_content: Some(native_content),
                rendering_content: Some(rendering),
                stop_reason: None,
            },
            metadata: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_defaults() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content.text, "hello");
        assert!(m.content.native_content.is_none());
        assert!(m.metadata.is_none());
    }

    #[test]
    fn test_message_serde_skips_empty_fields() {
        let m = Message::user("hi");
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("native_content"));
        assert!(!json.contains("metadata"));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn test_tool_results_carry_native_blocks() {
        let native = serde_json::json!([
            {"type": "tool_result", "tool_use_id": "t1", "content": "42"}
        ]);
        let m = Message::tool_results(native.clone(), vec![]);
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content.native_content, Some(native));
        assert!(m.content.text.is_empty());
    }
}
