//! OpenAI Chat Completions provider for `converse`.
//!
//! Streams chat completions over SSE and normalizes them into the
//! canonical [`converse::chunk`] protocol, including reasoning deltas,
//! fragment-assembled tool calls, and cached-token usage details. Works
//! against any chat-completions-compatible server by overriding
//! [`OpenAIConfig::base_url`].
//!
//! ```rust,no_run
//! use converse_openai::{OpenAIClient, OpenAIConfig};
//!
//! let client = OpenAIClient::new(OpenAIConfig {
//!     api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
//!     ..Default::default()
//! });
//! ```

#![warn(missing_docs)]

mod config;
mod convert;
mod provider;
mod stream;
mod types;

pub use config::OpenAIConfig;
pub use provider::OpenAIClient;
