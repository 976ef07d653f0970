//! Static per-model price table and the naive token estimator.

use std::collections::HashMap;

use serde::Serialize;

use crate::domain::response::ModelTier;

/// Price entry used for models missing from the table.
pub const FALLBACK_MODEL: &str = "gpt-4o";
/// Model that guards price requests against when the caller names none.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPrice {
    /// EUR per one million prompt tokens.
    pub prompt_per_million: f64,
    /// EUR per one million completion tokens.
    pub completion_per_million: f64,
    pub tier: ModelTier,
}

impl ModelPrice {
    pub fn cost_eur(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 * self.prompt_per_million / 1_000_000.0
            + completion_tokens as f64 * self.completion_per_million / 1_000_000.0
    }
}

#[derive(Clone, Debug)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        let gpt_4o = ModelPrice {
            prompt_per_million: 4.60,
            completion_per_million: 13.80,
            tier: ModelTier::Premium,
        };
        let prices = HashMap::from([
            (FALLBACK_MODEL.to_string(), gpt_4o),
            (
                DEFAULT_MODEL.to_string(),
                ModelPrice {
                    prompt_per_million: 0.14,
                    completion_per_million: 0.56,
                    tier: ModelTier::Economy,
                },
            ),
            (
                "o1-preview".to_owned(),
                ModelPrice {
                    prompt_per_million: 13.80,
                    completion_per_million: 55.20,
                    tier: ModelTier::DeepReasoning,
                },
            ),
            (
                "o1-mini".to_owned(),
                ModelPrice {
                    prompt_per_million: 2.76,
                    completion_per_million: 11.04,
                    tier: ModelTier::DeepReasoningLite,
                },
            ),
        ]);
        Self { prices, fallback: gpt_4o }
    }
}

impl PriceTable {
    pub fn empty(fallback: ModelPrice) -> Self {
        Self { prices: HashMap::new(), fallback }
    }

    pub fn with_price(mut self, model_id: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model_id.into(), price);
        self
    }

    /// Unknown models are priced like the fallback model.
    pub fn price_for(&self, model_id: &str) -> ModelPrice {
        self.prices.get(model_id).copied().unwrap_or(self.fallback)
    }

    pub fn is_known(&self, model_id: &str) -> bool {
        self.prices.contains_key(model_id)
    }
}

/// Rough token count: `max(words * 1.33, chars / 4.2)`, truncated.
///
/// Pure and monotone in input length; precision is not a goal.
pub fn naive_token_estimate(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count().max(1) as f64;
    let chars = text.chars().count() as f64;
    (words * 1.33).max(chars / 4.2) as u64
}
