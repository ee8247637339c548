//! The provider abstraction.
//!
//! [`ProviderClient`] is the trait each backend implements, using
//! `async fn` in traits for ergonomic implementations. Because AFIT
//! traits are not object-safe, [`DynProviderClient`] mirrors the trait
//! with boxed futures and a blanket impl, so registries and the agent
//! loop can hold `Arc<dyn DynProviderClient>`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::ChunkStream;
use crate::message::Message;

/// A tool the model may call, in provider-neutral form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// What the tool does, shown to the model.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: Value,
}

/// Per-call configuration passed to [`ProviderClient::stream`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Model identifier, in the provider's namespace.
    pub model: String,
    /// Sampling temperature. Providers ignore it when reasoning is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Output-token ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Reasoning token budget. `Some` turns extended reasoning on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_budget: Option<u32>,
    /// System prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Tools offered to the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Text the assistant reply must begin with. Providers either send
    /// it as a trailing assistant message or withhold it and prepend it
    /// to the streamed output, depending on mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill: Option<String>,
    /// Whether to enable the provider's server-side web search.
    #[serde(default)]
    pub web_search: bool,
}

/// Static facts about a configured provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMetadata {
    /// Provider name, e.g. `"anthropic"`.
    pub name: Cow<'static, str>,
    /// The configured default model.
    pub model: String,
    /// Context-window size of that model, in tokens.
    pub context_window: u64,
}

/// A streaming chat backend.
///
/// `stream` is infallible by design: request-construction and transport
/// failures surface as a stream that immediately completes with an
/// error-tagged terminal result, so callers have a single consumption
/// path.
pub trait ProviderClient: Send + Sync {
    /// Starts a streaming completion over the given conversation.
    fn stream(
        &self,
        messages: &[Message],
        config: &StreamConfig,
    ) -> impl Future<Output = ChunkStream> + Send;

    /// Static facts about this provider instance.
    fn metadata(&self) -> ProviderMetadata;
}

/// Object-safe mirror of [`ProviderClient`], implemented for every
/// `ProviderClient` via the blanket impl below.
pub trait DynProviderClient: Send + Sync {
    /// Boxed-future version of [`ProviderClient::stream`].
    fn stream_boxed<'a>(
        &'a self,
        messages: &'a [Message],
        config: &'a StreamConfig,
    ) -> Pin<Box<dyn Future<Output = ChunkStream> + Send + 'a>>;

    /// Static facts about this provider instance.
    fn metadata(&self) -> ProviderMetadata;
}

impl<P: ProviderClient> DynProviderClient for P {
    fn stream_boxed<'a>(
        &'a self,
        messages: &'a [Message],
        config: &'a StreamConfig,
    ) -> Pin<Box<dyn Future<Output = ChunkStream> + Send + 'a>> {
        Box::pin(self.stream(messages, config))
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderClient::metadata(self)
    }
}

/// A name-keyed collection of providers.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn DynProviderClient>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under the given name, replacing any
    /// previous registration.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn DynProviderClient>) {
        self.providers.insert(name.into(), provider);
    }

    /// Looks up a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DynProviderClient>> {
        self.providers.get(name).cloned()
    }

    /// Registered provider names, in arbitrary order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{error_stream, StreamError};

    struct NullProvider;

    impl ProviderClient for NullProvider {
        async fn stream(&self, _messages: &[Message], _config: &StreamConfig) -> ChunkStream {
            error_stream(StreamError {
                message: "null provider".into(),
                status: None,
            })
        }

        fn metadata(&self) -> ProviderMetadata {
            ProviderMetadata {
                name: Cow::Borrowed("null"),
                model: "none".into(),
                context_window: 0,
            }
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProviderRegistry::new();
        registry.register("null", Arc::new(NullProvider));
        assert!(registry.get("null").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_blanket_dyn_impl() {
        let provider: Arc<dyn DynProviderClient> = Arc::new(NullProvider);
        assert_eq!(provider.metadata().name, "null");
        let _stream = provider.stream_boxed(&[], &StreamConfig::default()).await;
    }
}
