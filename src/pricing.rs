//! Static pricing table mapping `(provider, model)` to per-token costs.
//!
//! Prices are stored per token so that cost estimation is a single
//! multiply-add per direction. Configuration supplies rates per million
//! tokens, which is how vendors publish them.

use std::collections::HashMap;

/// Built-in rates in USD per million tokens: (provider, model, input, output).
const DEFAULT_PRICING: &[(&str, &str, f64, f64)] = &[
    ("openai", "gpt-4", 30.0, 60.0),
    ("openai", "gpt-4-turbo", 10.0, 30.0),
    ("openai", "gpt-4-turbo-preview", 10.0, 30.0),
    ("openai", "gpt-4-32k", 60.0, 120.0),
    ("openai", "gpt-4o", 2.5, 10.0),
    ("openai", "gpt-4o-mini", 0.15, 0.6),
    ("openai", "gpt-3.5-turbo", 0.5, 1.5),
    ("openai", "gpt-3.5-turbo-16k", 3.0, 4.0),
    ("anthropic", "claude-3-5-sonnet-20241022", 3.0, 15.0),
    ("anthropic", "claude-3-5-sonnet", 3.0, 15.0),
    ("anthropic", "claude-3-opus", 15.0, 75.0),
    ("anthropic", "claude-3-sonnet", 3.0, 15.0),
    ("anthropic", "claude-3-haiku", 0.25, 1.25),
];

/// Cost of a single input and output token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenPrice {
    pub input: f64,
    pub output: f64,
}

impl TokenPrice {
    pub fn per_token(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// Build a price from per-million-token rates.
    pub fn per_million(input: f64, output: f64) -> Self {
        Self {
            input: input / 1_000_000.0,
            output: output / 1_000_000.0,
        }
    }

    /// `input_tokens * input + output_tokens * output`.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        input_tokens as f64 * self.input + output_tokens as f64 * self.output
    }
}

/// No pricing entry exists for the requested pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No pricing configured for provider '{provider}' model '{model}'")]
pub struct PricingNotFound {
    pub provider: String,
    pub model: String,
}

/// Lookup table keyed by provider name, then model id.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, HashMap<String, TokenPrice>>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table pre-populated with well-known OpenAI and Anthropic rates.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for (provider, model, input, output) in DEFAULT_PRICING {
            table.insert(provider, model, TokenPrice::per_million(*input, *output));
        }
        table
    }

    /// Insert or replace the price for a pair.
    pub fn insert(&mut self, provider: &str, model: &str, price: TokenPrice) {
        self.entries
            .entry(provider.to_string())
            .or_default()
            .insert(model.to_string(), price);
    }

    pub fn get(&self, provider: &str, model: &str) -> Result<TokenPrice, PricingNotFound> {
        self.entries
            .get(provider)
            .and_then(|models| models.get(model))
            .copied()
            .ok_or_else(|| PricingNotFound {
                provider: provider.to_string(),
                model: model.to_string(),
            })
    }

    pub fn contains(&self, provider: &str, model: &str) -> bool {
        self.get(provider, model).is_ok()
    }

    /// Pure cost estimate for a call with the given token counts.
    pub fn estimate_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<f64, PricingNotFound> {
        Ok(self.get(provider, model)?.cost(input_tokens, output_tokens))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
