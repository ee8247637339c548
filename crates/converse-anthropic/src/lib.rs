//! Anthropic Messages API provider for `converse`.
//!
//! Streams chat completions over SSE and normalizes them into the
//! canonical [`converse::chunk`] protocol, including extended thinking,
//! client tools, server-side web search and fetch, citations, and
//! prompt-cache breakpoints.
//!
//! ```rust,no_run
//! use converse_anthropic::{AnthropicClient, AnthropicConfig};
//!
//! let client = AnthropicClient::new(AnthropicConfig {
//!     api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
//!     ..Default::default()
//! });
//! ```

#![warn(missing_docs)]

mod config;
mod convert;
mod provider;
mod stream;
mod types;

pub use config::AnthropicConfig;
pub use provider::AnthropicClient;
