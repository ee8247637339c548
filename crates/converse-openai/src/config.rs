//! OpenAI client configuration.

use std::time::Duration;

/// Configuration for [`OpenAIClient`](crate::OpenAIClient).
///
/// Use struct update syntax with [`Default`]:
///
/// ```rust
/// use converse_openai::OpenAIConfig;
///
/// let config = OpenAIConfig {
///     api_key: "sk-...".into(),
///     model: "gpt-4o".into(),
///     ..Default::default()
/// };
/// ```
#[derive(Clone)]
pub struct OpenAIConfig {
    /// OpenAI API key. Required.
    pub api_key: String,
    /// Default model identifier.
    pub model: String,
    /// Base URL for the API. Override for Azure, proxies, or any
    /// chat-completions-compatible server.
    pub base_url: String,
    /// Max completion tokens when the stream config does not specify one.
    pub max_tokens: u32,
    /// Request timeout. `None` uses reqwest's default.
    pub timeout: Option<Duration>,
    /// Pre-configured HTTP client for connection pooling across
    /// providers. When `None`, a new client is created.
    pub client: Option<reqwest::Client>,
}

impl std::fmt::Debug for OpenAIConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("client", &self.client.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o".into(),
            base_url: "https://api.openai.com".into(),
            max_tokens: 4096,
            timeout: None,
            client: None,
        }
    }
}
