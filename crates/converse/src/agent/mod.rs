//! The agentic conversation loop.
//!
//! [`run_loop`] drives the stream → assemble → persist → execute-tools
//! cycle until the model finishes its turn, an unrecoverable error
//! occurs, or the iteration cap is hit. [`pending`] handles the
//! aftermath of runs that ended with tool calls still unanswered, and
//! [`swipe`] compacts old rounds so long conversations keep fitting the
//! context window.

mod context;
pub mod pending;
mod runner;
pub mod swipe;

pub use context::AgentContext;
pub use runner::{run_loop, LoopResult, LoopStatus, MAX_ITERATIONS};
