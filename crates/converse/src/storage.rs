//! Persistence seams.
//!
//! [`ChatStore`] is the object-safe trait the host wires to its
//! database. The loop persists in a fixed order after every round —
//! assistant message, then tool-result message, then chat totals — so a
//! crash between writes can lose at most the tail of the newest round,
//! never the pairing of a tool call with its result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;
use crate::message::Message;
use crate::tool::BoxFuture;
use crate::usage::{ChatTotals, ModelPricing};

/// A conversation's persisted header row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    /// Stable unique id.
    pub id: Uuid,
    /// User-visible title.
    pub title: String,
    /// The provider this chat talks to, by registry name.
    pub provider: String,
    /// The model in the provider's namespace.
    pub model: String,
    /// Running usage/cost totals.
    pub totals: ChatTotals,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Static facts about a model, as the host's catalog records them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier in the provider's namespace.
    pub id: String,
    /// Context-window size, in tokens.
    pub context_window: u64,
    /// Billing rates.
    pub pricing: ModelPricing,
}

/// Object-safe persistence backend for conversations.
pub trait ChatStore: Send + Sync {
    /// Loads every message of a chat, oldest first.
    fn get_messages(&self, chat_id: Uuid) -> BoxFuture<'_, Result<Vec<Message>, ChatError>>;

    /// Appends one message to a chat.
    fn save_message(
        &self,
        chat_id: Uuid,
        message: &Message,
    ) -> BoxFuture<'_, Result<(), ChatError>>;

    /// Writes the chat header, including updated totals.
    fn save_chat(&self, chat: &Chat) -> BoxFuture<'_, Result<(), ChatError>>;

    /// Looks up a model in the host's catalog.
    fn get_model(&self, model_id: &str) -> BoxFuture<'_, Result<Option<ModelInfo>, ChatError>>;
}
