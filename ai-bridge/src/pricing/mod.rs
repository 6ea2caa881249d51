use serde::{Deserialize, Serialize};

pub const DEFAULT_TIER_THRESHOLD: u64 = 200_000;
const PER_MILLION: f64 = 1_000_000.0;

/// Per-model rates in USD per million tokens.
///
/// Tokens up to `threshold` are billed at the base rate, anything beyond it
/// at the `_high` rate. A flat model uses the same rate on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    pub input_rate: f64,
    pub input_rate_high: f64,
    pub output_rate: f64,
    pub output_rate_high: f64,
    pub threshold: u64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_rate: 0.0,
            input_rate_high: 0.0,
            output_rate: 0.0,
            output_rate_high: 0.0,
            threshold: DEFAULT_TIER_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostBreakdown {
    pub prompt_cost: f64,
    pub completion_cost: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.prompt_cost + self.completion_cost
    }
}

impl ModelPricing {
    pub fn tiered(input_rate: f64, input_rate_high: f64, output_rate: f64, output_rate_high: f64) -> Self {
        Self {
            input_rate,
            input_rate_high,
            output_rate,
            output_rate_high,
            threshold: DEFAULT_TIER_THRESHOLD,
        }
    }

    pub fn flat(input_rate: f64, output_rate: f64) -> Self {
        Self::tiered(input_rate, input_rate, output_rate, output_rate)
    }

    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> CostBreakdown {
        CostBreakdown {
            prompt_cost: tiered_cost(prompt_tokens, self.threshold, self.input_rate, self.input_rate_high),
            completion_cost: tiered_cost(
                completion_tokens,
                self.threshold,
                self.output_rate,
                self.output_rate_high,
            ),
        }
    }
}

pub fn tiered_cost(tokens: u64, threshold: u64, rate: f64, rate_high: f64) -> f64 {
    if tokens <= threshold {
        tokens as f64 / PER_MILLION * rate
    } else {
        threshold as f64 / PER_MILLION * rate + (tokens - threshold) as f64 / PER_MILLION * rate_high
    }
}

/// A provider-declared cost wins when it is positive; otherwise the tiered estimate stands.
pub fn reconcile_cost(provider_cost: f64, estimate: &CostBreakdown) -> f64 {
    if provider_cost > 0.0 {
        provider_cost
    } else {
        estimate.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_prompt_tokens_above_threshold_use_high_rate() {
        let pricing = ModelPricing::tiered(1.25, 2.50, 10.0, 15.0);
        let cost = pricing.cost(250_000, 0);
        assert_eq!(cost.prompt_cost, 200000.0 / 1e6 * 1.25 + 50000.0 / 1e6 * 2.50);
        assert_eq!(cost.completion_cost, 0.0);
    }

    #[rstest]
    #[case(0, 0.0)]
    #[case(1_000_000, 10.0)]
    #[case(200_000, 2.0)]
    fn test_completion_cost_below_or_at_threshold(#[case] tokens: u64, #[case] expected: f64) {
        let pricing = ModelPricing::tiered(1.25, 2.50, 10.0, 15.0);
        let pricing = ModelPricing {
            threshold: 1_000_000,
            ..pricing
        };
        assert!((pricing.cost(0, tokens).completion_cost - expected).abs() < 1e-12);
    }

    #[test]
    fn test_completion_cost_above_threshold() {
        let pricing = ModelPricing::tiered(1.25, 2.50, 10.0, 15.0);
        let cost = pricing.cost(0, 300_000);
        assert!((cost.completion_cost - (2.0 + 1.5)).abs() < 1e-12);
    }

    #[test]
    fn test_flat_pricing_ignores_threshold() {
        let pricing = ModelPricing::flat(0.10, 0.40);
        let cost = pricing.cost(400_000, 400_000);
        assert!((cost.prompt_cost - 0.04).abs() < 1e-12);
        assert!((cost.completion_cost - 0.16).abs() < 1e-12);
    }

    #[rstest]
    #[case(0.5, 0.5)]
    #[case(0.0, 0.3)]
    #[case(-1.0, 0.3)]
    fn test_reconcile_cost(#[case] provider_cost: f64, #[case] expected: f64) {
        let estimate = CostBreakdown {
            prompt_cost: 0.1,
            completion_cost: 0.2,
        };
        assert!((reconcile_cost(provider_cost, &estimate) - expected).abs() < 1e-12);
    }
}
