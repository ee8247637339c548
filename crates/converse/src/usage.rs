//! Token accounting and cost calculation.
//!
//! [`TokenUsage`] counts tokens for a single model call and merges
//! reports with saturating arithmetic. [`Cost`] stores money as integer
//! microdollars so repeated accumulation never drifts. [`ModelPricing`]
//! holds per-million-token rates and converts usage to cost.
//! [`ChatTotals`] is the per-conversation running total; it only ever
//! grows.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Token counts for a single model call.
///
/// Providers may report usage more than once per stream (e.g. input
/// counts at start, output counts at end); merge reports with `+=`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the submitted prompt.
    pub input_tokens: u64,
    /// Tokens generated in the reply.
    pub output_tokens: u64,
    /// Reasoning tokens, for models that report them separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    /// Tokens written to the provider-side prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,
    /// Tokens served from the provider-side prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
}

fn add_optional(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
    }
}

impl TokenUsage {
    /// Tokens occupying the model's context window after this call.
    ///
    /// Cache reads and writes count toward the window; reasoning tokens
    /// are discarded by the provider between turns and do not.
    pub fn context_window_usage(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_creation_tokens.unwrap_or(0))
            .saturating_add(self.cache_read_tokens.unwrap_or(0))
            .saturating_sub(self.reasoning_tokens.unwrap_or(0))
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.saturating_add(rhs.input_tokens),
            output_tokens: self.output_tokens.saturating_add(rhs.output_tokens),
            reasoning_tokens: add_optional(self.reasoning_tokens, rhs.reasoning_tokens),
            cache_creation_tokens: add_optional(
                self.cache_creation_tokens,
                rhs.cache_creation_tokens,
            ),
            cache_read_tokens: add_optional(self.cache_read_tokens, rhs.cache_read_tokens),
        }
    }
}

impl AddAssign<&TokenUsage> for TokenUsage {
    fn add_assign(&mut self, rhs: &TokenUsage) {
        *self = *self + *rhs;
    }
}

/// A monetary amount stored as integer microdollars (1_000_000 = $1).
///
/// Integer representation keeps repeated accumulation exact; the field
/// is private so values can only be built through the constructors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost {
    microdollars: u64,
}

impl Cost {
    /// A zero cost.
    pub const ZERO: Cost = Cost { microdollars: 0 };

    /// Builds a cost from raw microdollars.
    pub fn from_microdollars(microdollars: u64) -> Self {
        Self { microdollars }
    }

    /// The raw microdollar value.
    pub fn microdollars(&self) -> u64 {
        self.microdollars
    }

    /// The value in dollars, for display only.
    pub fn as_dollars(&self) -> f64 {
        self.microdollars as f64 / 1_000_000.0
    }

    /// Checked addition; `None` on overflow.
    pub fn checked_add(self, rhs: Cost) -> Option<Cost> {
        self.microdollars
            .checked_add(rhs.microdollars)
            .map(|microdollars| Cost { microdollars })
    }

    /// Saturating addition.
    pub fn saturating_add(self, rhs: Cost) -> Cost {
        Cost {
            microdollars: self.microdollars.saturating_add(rhs.microdollars),
        }
    }
}

impl std::fmt::Display for Cost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${:.4}", self.as_dollars())
    }
}

/// Per-million-token rates for a model, in microdollars.
///
/// A rate of `3_000_000` means $3.00 per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Rate for prompt tokens.
    pub input_per_mtok: u64,
    /// Rate for generated tokens (reasoning tokens bill at this rate).
    pub output_per_mtok: u64,
    /// Rate for cache writes; falls back to the input rate when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_per_mtok: Option<u64>,
    /// Rate for cache reads; falls back to the input rate when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_per_mtok: Option<u64>,
}

impl ModelPricing {
    /// The cost of a single call under this pricing.
    pub fn cost_of(&self, usage: &TokenUsage) -> Cost {
        fn rate(tokens: u64, per_mtok: u64) -> u64 {
            // u128 intermediate avoids overflow at large token counts.
            ((tokens as u128 * per_mtok as u128) / 1_000_000) as u64
        }

        let mut micro = rate(usage.input_tokens, self.input_per_mtok);
        micro = micro.saturating_add(rate(usage.output_tokens, self.output_per_mtok));
        if let Some(tokens) = usage.cache_creation_tokens {
            micro = micro.saturating_add(rate(
                tokens,
                self.cache_creation_per_mtok.unwrap_or(self.input_per_mtok),
            ));
        }
        if let Some(tokens) = usage.cache_read_tokens {
            micro = micro.saturating_add(rate(
                tokens,
                self.cache_read_per_mtok.unwrap_or(self.input_per_mtok),
            ));
        }
        Cost::from_microdollars(micro)
    }
}

/// Running totals for a whole conversation.
///
/// Totals are additive-only: [`ChatTotals::record`] is the single write
/// path and it never subtracts, so totals are monotonic even when
/// individual calls fail partway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTotals {
    /// Summed token usage across every call in the conversation.
    pub usage: TokenUsage,
    /// Summed cost across every call in the conversation.
    pub cost: Cost,
}

impl ChatTotals {
    /// Folds one call's usage and cost into the totals.
    pub fn record(&mut self, usage: &TokenUsage, cost: Cost) {
        self.usage += usage;
        self.cost = self.cost.saturating_add(cost);
    }
}

/// Context-window occupancy for display, taken from the most recent
/// assistant message carrying metadata. `None` when no assistant turn
/// has completed yet.
pub fn display_context_usage(messages: &[Message]) -> Option<u64> {
    messages
        .iter()
        .rev()
        .find_map(|message| message.metadata.as_ref())
        .map(|metadata| metadata.usage.context_window_usage())
}
