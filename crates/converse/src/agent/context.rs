//! Everything a loop run needs, gathered in one place.

use std::sync::Arc;

use crate::events::EventSink;
use crate::message::Message;
use crate::provider::{DynProviderClient, StreamConfig};
use crate::storage::{Chat, ChatStore};
use crate::tool::{SessionPool, ToolRegistry};

/// The collaborators and state of one agent-loop run.
///
/// The context is consumed by [`run_loop`](super::run_loop); `messages`
/// holds the conversation so far and grows as the loop persists new
/// turns.
pub struct AgentContext {
    /// The conversation header. Totals are updated as rounds complete.
    pub chat: Chat,
    /// The conversation history, oldest first.
    pub messages: Vec<Message>,
    /// The backend to stream against.
    pub provider: Arc<dyn DynProviderClient>,
    /// Per-call configuration. Tool definitions are filled in from the
    /// registry at loop start.
    pub config: StreamConfig,
    /// The tools offered to the model.
    pub tools: ToolRegistry,
    /// Session holder for session-requiring tools. Disposed exactly
    /// once when the loop ends, however it ends.
    pub sessions: SessionPool,
    /// Persistence backend.
    pub store: Arc<dyn ChatStore>,
    /// UI notification sink.
    pub events: EventSink,
    /// When set, old rounds are slimmed down
    /// ([`compact_messages`](super::swipe::compact_messages)) in the
    /// history sent to the provider each round. The persisted
    /// conversation is never touched.
    pub compact_history: bool,
}

impl AgentContext {
    /// A context with no tools and no UI sink, for headless use.
    pub fn headless(
        chat: Chat,
        messages: Vec<Message>,
        provider: Arc<dyn DynProviderClient>,
        config: StreamConfig,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        Self {
            chat,
            messages,
            provider,
            config,
            tools: ToolRegistry::new(),
            sessions: SessionPool::new(None),
            store,
            events: EventSink::disabled(),
            compact_history: false,
        }
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("chat", &self.chat.id)
            .field("messages", &self.messages.len())
            .field("provider", &self.provider.metadata().name)
            .finish()
    }
}
