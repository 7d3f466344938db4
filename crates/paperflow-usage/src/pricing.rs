//! Provider pricing in integer nanodollars.
//!
//! Prices are configured in USD per 1K tokens and converted once, when the
//! table is built, so every per-call cost is exact integer arithmetic and
//! aggregate sums never drift.

use paperflow_core::config::ProviderConfig;
use paperflow_core::{ProviderId, TokenUsage};
use std::collections::HashMap;

/// 1 USD expressed in nanodollars.
pub const NANOS_PER_USD: u64 = 1_000_000_000;

/// Price of one provider in nanodollars per 1K tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderPricing {
    pub input_nanos_per_1k: u64,
    pub output_nanos_per_1k: u64,
}

impl ProviderPricing {
    /// Convert USD-per-1K prices. Negative or non-finite prices become zero.
    pub fn from_usd_per_1k(input: f64, output: f64) -> Self {
        Self {
            input_nanos_per_1k: usd_to_nanos(input),
            output_nanos_per_1k: usd_to_nanos(output),
        }
    }

    /// Cost of a call, rounded half-up to the nearest nanodollar.
    pub fn cost_nanos(&self, usage: &TokenUsage) -> u64 {
        let weighted = u128::from(usage.input_tokens) * u128::from(self.input_nanos_per_1k)
            + u128::from(usage.output_tokens) * u128::from(self.output_nanos_per_1k);
        let cost = (weighted + 500) / 1000;
        u64::try_from(cost).unwrap_or(u64::MAX)
    }
}

fn usd_to_nanos(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * NANOS_PER_USD as f64).round() as u64
    } else {
        0
    }
}

/// Nanodollars to USD, for display only.
pub fn nanos_to_usd(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_USD as f64
}

/// Per-provider price lookup used by the accountant.
pub trait PricingTable: Send + Sync {
    /// Pricing for a provider, if known.
    fn pricing(&self, provider: &ProviderId) -> Option<ProviderPricing>;

    /// Cost of a call. Unknown providers cost nothing.
    fn cost_nanos(&self, provider: &ProviderId, usage: &TokenUsage) -> u64 {
        self.pricing(provider)
            .map(|p| p.cost_nanos(usage))
            .unwrap_or(0)
    }
}

/// In-memory pricing table.
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    table: HashMap<ProviderId, ProviderPricing>,
}

impl StaticPricing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl Into<ProviderId>, pricing: ProviderPricing) -> Self {
        self.table.insert(provider.into(), pricing);
        self
    }

    /// Build from the `pricing` sections of configured providers.
    pub fn from_config(providers: &[ProviderConfig]) -> Self {
        let table = providers
            .iter()
            .filter_map(|p| {
                p.pricing.as_ref().map(|price| {
                    (
                        p.id.clone(),
                        ProviderPricing::from_usd_per_1k(price.input_per_1k, price.output_per_1k),
                    )
                })
            })
            .collect();
        Self { table }
    }
}

impl PricingTable for StaticPricing {
    fn pricing(&self, provider: &ProviderId) -> Option<ProviderPricing> {
        self.table.get(provider).copied()
    }
}
