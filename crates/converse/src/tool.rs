//! Tool execution.
//!
//! [`ToolExecutor`] is the object-safe trait host applications
//! implement per tool. Execution is mediated by a [`ToolRegistry`],
//! which enforces the cardinal rule of the tool loop: **every tool-use
//! id gets exactly one result block**, whatever goes wrong. Unknown
//! tools, executor errors and truncated tool streams all fold into an
//! `is_error` result that is fed back to the model, never raised to the
//! caller.
//!
//! Tools that hold external state (a browser, a sandbox) declare
//! [`requires_session`](ToolExecutor::requires_session); the registry
//! then draws a shared session from the [`SessionPool`], which creates
//! it lazily on first use and is disposed exactly once when the agent
//! loop ends.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::content::{RenderingBlockGroup, ToolResultBlock, ToolUseBlock};
use crate::error::ChatError;
use crate::events::{EventSink, UiEvent};
use crate::provider::ToolDefinition;

/// A pinned, boxed, `Send` future — the return type of object-safe
/// async trait methods in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// External state shared by session-requiring tools for the duration of
/// one agent loop.
pub trait ToolSession: Send + Sync {
    /// Releases the session's resources. Called exactly once, after the
    /// loop ends.
    fn dispose(&self) -> BoxFuture<'_, ()>;
}

/// Builds a [`ToolSession`] on first demand.
pub type SessionFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn ToolSession>, ChatError>> + Send + Sync>;

/// Lazily-created, once-disposed holder of the loop's tool session.
pub struct SessionPool {
    factory: Option<SessionFactory>,
    session: Option<Arc<dyn ToolSession>>,
    disposed: bool,
}

impl SessionPool {
    /// A pool backed by `factory`. Pass `None` when no tool needs a
    /// session.
    pub fn new(factory: Option<SessionFactory>) -> Self {
        Self {
            factory,
            session: None,
            disposed: false,
        }
    }

    /// The shared session, creating it on first call. `Ok(None)` when
    /// no factory is configured.
    pub async fn get_or_create(&mut self) -> Result<Option<Arc<dyn ToolSession>>, ChatError> {
        if self.disposed {
            return Err(ChatError::InvalidRequest(
                "tool session pool already disposed".into(),
            ));
        }
        if self.session.is_none() {
            if let Some(factory) = &self.factory {
                self.session = Some(factory().await?);
            }
        }
        Ok(self.session.clone())
    }

    /// Disposes the session if one was created. Idempotent.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(session) = self.session.take() {
            session.dispose().await;
        }
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("has_factory", &self.factory.is_some())
            .field("has_session", &self.session.is_some())
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// What a tool produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolResult {
    /// Text fed back to the model.
    pub content: String,
    /// Whether the tool failed. Failures are model-visible, not raised.
    pub is_error: bool,
    /// Extra display groups (e.g. an image the tool rendered), appended
    /// after the result block.
    pub rendering_groups: Vec<RenderingBlockGroup>,
}

impl ToolResult {
    /// A successful text result.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// A failed result whose message the model will see.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            ..Default::default()
        }
    }
}

/// One item from a streaming tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolStreamItem {
    /// A progress label, forwarded to the UI.
    Event {
        /// Progress label.
        label: String,
    },
    /// The final result. Always the last item.
    Done(ToolResult),
}

/// A pinned, boxed stream of [`ToolStreamItem`]s.
pub type ToolEventStream = Pin<Box<dyn Stream<Item = ToolStreamItem> + Send>>;

/// How a tool chose to respond: all at once, or progressively.
pub enum ToolInvocation {
    /// The result, immediately.
    Complete(ToolResult),
    /// A stream of progress events ending in a result.
    Streaming(ToolEventStream),
}

/// A tool the agent loop can execute. Object-safe; registries hold
/// `Arc<dyn ToolExecutor>`.
pub trait ToolExecutor: Send + Sync {
    /// The provider-neutral definition advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Whether this tool needs the shared [`ToolSession`].
    fn requires_session(&self) -> bool {
        false
    }

    /// Runs the tool. `session` is `Some` iff
    /// [`requires_session`](Self::requires_session) returned `true` and
    /// the pool produced one.
    fn execute<'a>(
        &'a self,
        input: Value,
        session: Option<Arc<dyn ToolSession>>,
    ) -> BoxFuture<'a, Result<ToolInvocation, ChatError>>;
}

/// The fully-folded outcome of one tool call: the result block for the
/// model plus any extra display groups.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// The result block answering the tool-use id.
    pub block: ToolResultBlock,
    /// Display groups appended after the result block.
    pub extra_groups: Vec<RenderingBlockGroup>,
}

/// Name-keyed collection of tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool` under its definition name.
    pub fn register(&mut self, tool: Arc<dyn ToolExecutor>) {
        self.tools.insert(tool.definition().name, tool);
    }

    /// Whether any registered tool requires a session.
    pub fn any_requires_session(&self) -> bool {
        self.tools.values().any(|tool| tool.requires_session())
    }

    /// The definitions of every registered tool, for the provider
    /// request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    /// Executes one tool call, folding every failure mode into an
    /// error-flagged result block. Infallible by contract: the call id
    /// always gets its result.
    pub async fn execute_call(
        &self,
        call: &ToolUseBlock,
        sessions: &mut SessionPool,
        events: &EventSink,
    ) -> ToolOutcome {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "model called an unregistered tool");
            return ToolOutcome {
                block: ToolResultBlock {
                    tool_use_id: call.id.clone(),
                    content: format!("Unknown tool: {}", call.name),
                    is_error: true,
                },
                extra_groups: Vec::new(),
            };
        };

        events.emit(UiEvent::ToolStarted {
            id: call.id.clone(),
            name: call.name.clone(),
        });
        let started = std::time::Instant::now();

        let result = self.run_tool(tool.as_ref(), call, sessions, events).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        events.emit(UiEvent::ToolFinished {
            id: call.id.clone(),
            is_error: result.is_error,
            duration_ms,
        });
        debug!(tool = %call.name, is_error = result.is_error, duration_ms, "tool call finished");

        ToolOutcome {
            block: ToolResultBlock {
                tool_use_id: call.id.clone(),
                content: result.content,
                is_error: result.is_error,
            },
            extra_groups: result.rendering_groups,
        }
    }

    async fn run_tool(
        &self,
        tool: &dyn ToolExecutor,
        call: &ToolUseBlock,
        sessions: &mut SessionPool,
        events: &EventSink,
    ) -> ToolResult {
        let session = if tool.requires_session() {
            match sessions.get_or_create().await {
                Ok(session) => session,
                Err(err) => return ToolResult::error(format!("Session setup failed: {err}")),
            }
        } else {
            None
        };

        match tool.execute(call.input.clone(), session).await {
            Ok(ToolInvocation::Complete(result)) => result,
            Ok(ToolInvocation::Streaming(mut stream)) => {
                while let Some(item) = stream.next().await {
                    match item {
                        ToolStreamItem::Event { label } => events.emit(UiEvent::ToolProgress {
                            id: call.id.clone(),
                            label,
                        }),
                        ToolStreamItem::Done(result) => return result,
                    }
                }
                ToolResult::error("tool stream returned no result")
            }
            Err(err) => ToolResult::error(err.to_string()),
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Echo;

    impl ToolExecutor for Echo {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "Echoes its input".into(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }

        fn execute<'a>(
            &'a self,
            input: Value,
            _session: Option<Arc<dyn ToolSession>>,
        ) -> BoxFuture<'a, Result<ToolInvocation, ChatError>> {
            Box::pin(async move {
                Ok(ToolInvocation::Complete(ToolResult::text(
                    input["text"].as_str().unwrap_or_default().to_string(),
                )))
            })
        }
    }

    struct Failing;

    impl ToolExecutor for Failing {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "failing".into(),
                description: "Always errors".into(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }

        fn execute<'a>(
            &'a self,
            _input: Value,
            _session: Option<Arc<dyn ToolSession>>,
        ) -> BoxFuture<'a, Result<ToolInvocation, ChatError>> {
            Box::pin(async {
                Err(ChatError::ToolExecution {
                    tool_name: "failing".into(),
                    message: "disk on fire".into(),
                })
            })
        }
    }

    struct Progressive;

    impl ToolExecutor for Progressive {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "progressive".into(),
                description: "Streams progress".into(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }

        fn execute<'a>(
            &'a self,
            _input: Value,
            _session: Option<Arc<dyn ToolSession>>,
        ) -> BoxFuture<'a, Result<ToolInvocation, ChatError>> {
            Box::pin(async {
                Ok(ToolInvocation::Streaming(Box::pin(futures::stream::iter([
                    ToolStreamItem::Event {
                        label: "step 1".into(),
                    },
                    ToolStreamItem::Done(ToolResult::text("done")),
                ]))))
            })
        }
    }

    fn call(name: &str) -> ToolUseBlock {
        ToolUseBlock {
            id: format!("call-{name}"),
            name: name.into(),
            input: serde_json::json!({"text": "hi"}),
        }
    }

    #[tokio::test]
    async fn test_execute_known_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let mut pool = SessionPool::new(None);
        let outcome = registry
            .execute_call(&call("echo"), &mut pool, &EventSink::disabled())
            .await;
        assert_eq!(outcome.block.content, "hi");
        assert!(!outcome.block.is_error);
    }

    #[tokio::test]
    async fn test_unknown_tool_gets_error_result() {
        let registry = ToolRegistry::new();
        let mut pool = SessionPool::new(None);
        let outcome = registry
            .execute_call(&call("nonexistent"), &mut pool, &EventSink::disabled())
            .await;
        assert!(outcome.block.is_error);
        assert_eq!(outcome.block.content, "Unknown tool: nonexistent");
        assert_eq!(outcome.block.tool_use_id, "call-nonexistent");
    }

    #[tokio::test]
    async fn test_executor_error_folds_into_result() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Failing));
        let mut pool = SessionPool::new(None);
        let outcome = registry
            .execute_call(&call("failing"), &mut pool, &EventSink::disabled())
            .await;
        assert!(outcome.block.is_error);
        assert!(outcome.block.content.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_streaming_tool_forwards_progress() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Progressive));
        let mut pool = SessionPool::new(None);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let outcome = registry
            .execute_call(&call("progressive"), &mut pool, &EventSink::new(tx))
            .await;
        assert_eq!(outcome.block.content, "done");
        let mut saw_progress = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, UiEvent::ToolProgress { .. }) {
                saw_progress = true;
            }
        }
        assert!(saw_progress);
    }

    struct CountingSession {
        disposals: Arc<AtomicUsize>,
    }

    impl ToolSession for CountingSession {
        fn dispose(&self) -> BoxFuture<'_, ()> {
            self.disposals.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn test_session_pool_lazy_and_idempotent() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let factory: SessionFactory = {
            let disposals = disposals.clone();
            let created = created.clone();
            Arc::new(move || {
                let disposals = disposals.clone();
                created.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    Ok(Arc::new(CountingSession { disposals }) as Arc<dyn ToolSession>)
                })
            })
        };

        let mut pool = SessionPool::new(Some(factory));
        assert_eq!(created.load(Ordering::SeqCst), 0);

        pool.get_or_create().await.unwrap();
        pool.get_or_create().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);

        pool.dispose().await;
        pool.dispose().await;
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert!(pool.is_disposed());
        assert!(pool.get_or_create().await.is_err());
    }

    #[tokio::test]
    async fn test_pool_without_factory_yields_no_session() {
        let mut pool = SessionPool::new(None);
        assert!(pool.get_or_create().await.unwrap().is_none());
        pool.dispose().await;
    }
}
