//! Anthropic client configuration.

use std::time::Duration;

/// Configuration for [`AnthropicClient`](crate::AnthropicClient).
///
/// Use struct update syntax with [`Default`]:
///
/// ```rust
/// use converse_anthropic::AnthropicConfig;
///
/// let config = AnthropicConfig {
///     api_key: "sk-ant-...".into(),
///     model: "claude-sonnet-4-20250514".into(),
///     ..Default::default()
/// };
/// ```
#[derive(Clone)]
pub struct AnthropicConfig {
    /// Anthropic API key. Required.
    pub api_key: String,
    /// Default model identifier.
    pub model: String,
    /// Base URL for the API. Override for proxies or testing.
    pub base_url: String,
    /// Max tokens when the stream config does not specify one.
    pub max_tokens: u32,
    /// `anthropic-version` header value.
    pub api_version: String,
    /// Request timeout. `None` uses reqwest's default.
    pub timeout: Option<Duration>,
    /// Pre-configured HTTP client for connection pooling across
    /// providers. When `None`, a new client is created.
    pub client: Option<reqwest::Client>,
}

impl std::fmt::Debug for AnthropicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("api_version", &self.api_version)
            .field("timeout", &self.timeout)
            .field("client", &self.client.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".into(),
            base_url: "https://api.anthropic.com".into(),
            max_tokens: 4096,
            api_version: "2023-06-01".into(),
            timeout: None,
            client: None,
        }
    }
}
