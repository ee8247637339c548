//! In-memory fakes for tests and downstream integration suites.
//!
//! [`MockProvider`] replays scripted chunk sequences and records every
//! call it receives; [`MemoryStore`] is a [`ChatStore`] over hash maps
//! with a switch to make writes fail, for exercising the error paths.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use uuid::Uuid;

use crate::chunk::{ChunkStream, StopReason, StreamChunk, StreamItem, StreamResult};
use crate::content::ToolUseBlock;
use crate::error::ChatError;
use crate::message::Message;
use crate::provider::{ProviderClient, ProviderMetadata, StreamConfig};
use crate::storage::{Chat, ChatStore, ModelInfo};
use crate::tool::BoxFuture;
use crate::usage::TokenUsage;

/// A scripted provider. Scripts are consumed in FIFO order; when the
/// queue is empty the fallback script (if any) replays indefinitely,
/// which keeps loop tests going as long as they need.
#[derive(Default)]
pub struct MockProvider {
    scripts: Mutex<VecDeque<Vec<StreamItem>>>,
    fallback: Mutex<Option<Vec<StreamItem>>>,
    calls: Mutex<Vec<(Vec<Message>, StreamConfig)>>,
}

impl MockProvider {
    /// A provider with no scripts; streams yield the synthetic
    /// missing-result error until scripts are enqueued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one script.
    pub fn enqueue(&self, script: Vec<StreamItem>) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Sets the script replayed once the queue is empty.
    pub fn set_fallback(&self, script: Vec<StreamItem>) {
        *self.fallback.lock().unwrap() = Some(script);
    }

    /// How many times `stream` was called.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// The recorded `(messages, config)` of every call.
    pub fn calls(&self) -> Vec<(Vec<Message>, StreamConfig)> {
        self.calls.lock().unwrap().clone()
    }

    /// A script for a plain text reply ending the turn.
    pub fn text_script(text: &str) -> Vec<StreamItem> {
        vec![
            StreamItem::Chunk(StreamChunk::ContentStart),
            StreamItem::Chunk(StreamChunk::ContentDelta { text: text.into() }),
            StreamItem::Chunk(StreamChunk::ContentEnd),
            StreamItem::Done(StreamResult {
                text_content: text.into(),
                native_content: Some(serde_json::json!([{"type": "text", "text": text}])),
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
                error: None,
            }),
        ]
    }

    /// A script where the model requests one tool call.
    pub fn tool_script(call: ToolUseBlock) -> Vec<StreamItem> {
        vec![
            StreamItem::Chunk(StreamChunk::ToolUse(call.clone())),
            StreamItem::Done(StreamResult {
                text_content: String::new(),
                native_content: Some(serde_json::json!([{
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.input,
                }])),
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
                error: None,
            }),
        ]
    }
}

impl ProviderClient for MockProvider {
    async fn stream(&self, messages: &[Message], config: &StreamConfig) -> ChunkStream {
        self.calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), config.clone()));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.lock().unwrap().clone())
            .unwrap_or_else(|| vec![StreamItem::Done(StreamResult::missing())]);
        Box::pin(futures::stream::iter(script))
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: Cow::Borrowed("mock"),
            model: "mock-model".into(),
            context_window: 200_000,
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    chats: HashMap<Uuid, Chat>,
    messages: HashMap<Uuid, Vec<Message>>,
    models: HashMap<String, ModelInfo>,
}

/// A [`ChatStore`] over in-memory maps.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    writes: AtomicUsize,
    fail_after: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            writes: AtomicUsize::new(0),
            fail_after: AtomicUsize::new(usize::MAX),
        }
    }
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a model to the catalog.
    pub fn add_model(&self, info: ModelInfo) {
        self.inner
            .lock()
            .unwrap()
            .models
            .insert(info.id.clone(), info);
    }

    /// When `true`, every write returns [`ChatError::Storage`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_after
            .store(if fail { 0 } else { usize::MAX }, Ordering::SeqCst);
    }

    /// Lets the next `n` writes succeed, then fails every one after.
    pub fn fail_after_writes(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    /// The persisted messages of a chat.
    pub fn messages(&self, chat_id: Uuid) -> Vec<Message> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .get(&chat_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The persisted header of a chat.
    pub fn chat(&self, chat_id: Uuid) -> Option<Chat> {
        self.inner.lock().unwrap().chats.get(&chat_id).cloned()
    }

    fn check_writable(&self) -> Result<(), ChatError> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst);
        if write >= self.fail_after.load(Ordering::SeqCst) {
            Err(ChatError::Storage("simulated write failure".into()))
        } else {
            Ok(())
        }
    }
}

impl ChatStore for MemoryStore {
    fn get_messages(&self, chat_id: Uuid) -> BoxFuture<'_, Result<Vec<Message>, ChatError>> {
        Box::pin(async move { Ok(self.messages(chat_id)) })
    }

    fn save_message(
        &self,
        chat_id: Uuid,
        message: &Message,
    ) -> BoxFuture<'_, Result<(), ChatError>> {
        let message = message.clone();
        Box::pin(async move {
            self.check_writable()?;
            self.inner
                .lock()
                .unwrap()
                .messages
                .entry(chat_id)
                .or_default()
                .push(message);
            Ok(())
        })
    }

    fn save_chat(&self, chat: &Chat) -> BoxFuture<'_, Result<(), ChatError>> {
        let chat = chat.clone();
        Box::pin(async move {
            self.check_writable()?;
            self.inner.lock().unwrap().chats.insert(chat.id, chat);
            Ok(())
        })
    }

    fn get_model(&self, model_id: &str) -> BoxFuture<'_, Result<Option<ModelInfo>, ChatError>> {
        let model_id = model_id.to_string();
        Box::pin(async move { Ok(self.inner.lock().unwrap().models.get(&model_id).cloned()) })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_scripts_consumed_in_order() {
        let provider = MockProvider::new();
        provider.enqueue(MockProvider::text_script("first"));
        provider.enqueue(MockProvider::text_script("second"));

        for expected in ["first", "second"] {
            let mut stream = provider.stream(&[], &StreamConfig::default()).await;
            let mut text = None;
            while let Some(item) = stream.next().await {
                if let StreamItem::Done(result) = item {
                    text = Some(result.text_content);
                }
            }
            assert_eq!(text.as_deref(), Some(expected));
        }
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_queue_without_fallback_yields_missing() {
        let provider = MockProvider::new();
        let mut stream = provider.stream(&[], &StreamConfig::default()).await;
        match stream.next().await.unwrap() {
            StreamItem::Done(result) => assert!(result.error.is_some()),
            StreamItem::Chunk(_) => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let chat_id = Uuid::new_v4();
        let message = Message::user("hello");
        store.save_message(chat_id, &message).await.unwrap();
        assert_eq!(store.get_messages(chat_id).await.unwrap(), vec![message]);
    }

    #[tokio::test]
    async fn test_memory_store_simulated_failure() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store
            .save_message(Uuid::new_v4(), &Message::user("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));
    }
}
