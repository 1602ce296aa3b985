//! Built-in model pricing
//!
//! Used by the local log source to price entries that were written without a `costUSD`
//! field. Model names are matched by family so dated releases resolve without a table
//! update; unknown models fall back to Sonnet pricing, the most common model.

use crate::models::{PricingData, UsageData};
use tracing::debug;

const PER_MILLION: f64 = 1_000_000.0;

/// (family pattern, input, output, cache creation, cache read) in USD per 1M tokens
const MODEL_FAMILIES: &[(&str, f64, f64, f64, f64)] = &[
    ("opus", 15.0, 75.0, 18.75, 1.50),
    ("sonnet", 3.0, 15.0, 3.75, 0.30),
    ("haiku", 0.80, 4.0, 1.0, 0.08),
];

#[derive(Debug, Clone)]
pub struct PricingTable {
    families: Vec<(String, PricingData)>,
    fallback: PricingData,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PricingTable {
    pub fn builtin() -> Self {
        let families = MODEL_FAMILIES
            .iter()
            .map(|(pattern, input, output, creation, read)| {
                (
                    pattern.to_string(),
                    PricingData {
                        input_cost_per_token: input / PER_MILLION,
                        output_cost_per_token: output / PER_MILLION,
                        cache_creation_input_token_cost: Some(creation / PER_MILLION),
                        cache_read_input_token_cost: Some(read / PER_MILLION),
                    },
                )
            })
            .collect::<Vec<_>>();

        let fallback = families
            .iter()
            .find(|(pattern, _)| pattern == "sonnet")
            .map(|(_, pricing)| pricing.clone())
            .unwrap_or(PricingData {
                input_cost_per_token: 3.0 / PER_MILLION,
                output_cost_per_token: 15.0 / PER_MILLION,
                cache_creation_input_token_cost: None,
                cache_read_input_token_cost: None,
            });

        Self { families, fallback }
    }

    pub fn pricing_for(&self, model: &str) -> &PricingData {
        let lower = model.to_lowercase();
        self.families
            .iter()
            .find(|(pattern, _)| lower.contains(pattern.as_str()))
            .map(|(_, pricing)| pricing)
            .unwrap_or_else(|| {
                debug!(model = %model, "No pricing family matched, using fallback pricing");
                &self.fallback
            })
    }

    pub fn cost_for(&self, model: &str, usage: &UsageData) -> f64 {
        let pricing = self.pricing_for(model);

        // Cache tokens are billed at the input rate when no dedicated rate exists
        let creation_rate = pricing
            .cache_creation_input_token_cost
            .unwrap_or(pricing.input_cost_per_token);
        let read_rate = pricing
            .cache_read_input_token_cost
            .unwrap_or(pricing.input_cost_per_token);

        usage.input_tokens as f64 * pricing.input_cost_per_token
            + usage.output_tokens as f64 * pricing.output_cost_per_token
            + usage.cache_creation_input_tokens as f64 * creation_rate
            + usage.cache_read_input_tokens as f64 * read_rate
    }
}
