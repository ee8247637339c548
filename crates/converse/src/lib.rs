//! Multi-provider streaming chat orchestration.
//!
//! `converse` turns heterogeneous LLM streaming APIs into one canonical
//! chunk protocol, assembles those chunks into render-ready content
//! live, and drives an agentic tool loop with persistence and
//! accounting along the way. Provider backends live in sibling crates
//! (`converse-anthropic`, `converse-openai`) and plug in through the
//! [`provider::ProviderClient`] trait.
//!
//! The main moving parts:
//!
//! - [`chunk`] — the canonical stream protocol: [`chunk::StreamChunk`]
//!   events ending in exactly one [`chunk::StreamResult`].
//! - [`assembler`] — [`assembler::ContentAssembler`] reduces chunks to
//!   [`content::RenderingBlockGroup`]s, identical mid-stream and at
//!   rest.
//! - [`agent`] — [`agent::run_loop`] runs the stream → persist →
//!   execute-tools cycle, capped at [`agent::MAX_ITERATIONS`] rounds,
//!   with guaranteed tool-session cleanup.
//! - [`usage`] — token counts, microdollar costs, per-chat totals.
//! - [`storage`] / [`events`] — the seams the host wires to its
//!   database and UI.
//!
//! # A minimal run
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use converse::agent::{run_loop, AgentContext};
//!
//! let ctx = AgentContext::headless(chat, messages, provider, config, store);
//! let result = run_loop(ctx).await;
//! println!("{:?}", result.status);
//! ```

#![warn(missing_docs)]

pub mod agent;
pub mod assembler;
pub mod chunk;
pub mod content;
pub mod error;
pub mod events;
pub mod message;
pub mod mock;
pub mod provider;
pub mod storage;
pub mod tool;
pub mod usage;

pub use assembler::ContentAssembler;
pub use chunk::{ChunkStream, StopReason, StreamChunk, StreamItem, StreamResult};
pub use error::ChatError;
pub use message::{Message, Role};
pub use provider::{DynProviderClient, ProviderClient, StreamConfig};
