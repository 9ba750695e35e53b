//! Cost accounting.
//!
//! Pricing is pluggable per provider. A model without a price costs zero;
//! the manager logs a warning, never an error.

use super::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPrice {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// Computes the cost of a call. `None` means the price is unknown.
pub trait PricingModel: Send + Sync {
    fn cost(&self, model: &str, usage: &TokenUsage) -> Option<f64>;
}

/// Prices by model name, with an optional price for any other model.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPrice>,
    fallback: Option<ModelPrice>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// One price for every model this provider serves.
    pub fn flat(price: ModelPrice) -> Self {
        Self {
            models: HashMap::new(),
            fallback: Some(price),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(model.into(), price);
        self
    }
}

impl PricingModel for PricingTable {
    fn cost(&self, model: &str, usage: &TokenUsage) -> Option<f64> {
        self.models
            .get(model)
            .or(self.fallback.as_ref())
            .map(|price| price.cost(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: usize, output: usize) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
        }
    }

    #[test]
    fn test_model_price() {
        let price = ModelPrice::new(3.0, 15.0);
        let cost = price.cost(&usage(1_000_000, 100_000));
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_table_lookup_and_fallback() {
        let table = PricingTable::new().with_model("small", ModelPrice::new(1.0, 2.0));
        assert!(table.cost("small", &usage(1_000_000, 0)).is_some());
        assert!(table.cost("large", &usage(10, 10)).is_none());

        let flat = PricingTable::flat(ModelPrice::new(1.0, 1.0));
        assert_eq!(flat.cost("anything", &usage(500_000, 500_000)), Some(1.0));
    }
}
