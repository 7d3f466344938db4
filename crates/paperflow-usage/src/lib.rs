//! Usage metering for provider calls.
//!
//! Every provider call an agent makes is recorded once, priced through a
//! pluggable per-provider table, and made available to aggregate queries by
//! provider, agent type, user, workflow run and time range.
//!
//! # Main types
//!
//! - [`Accountant`] — Append-only call log with consistent aggregate views.
//! - [`ProviderCall`] — Raw call data handed to [`Accountant::record`].
//! - [`ProviderCallRecord`] — Immutable, priced record.
//! - [`UsageFilter`] — Selects records for aggregation.
//! - [`RunningTotal`] — Tokens, cost and request counts over a selection.
//! - [`PricingTable`] — Per-provider price lookup; [`StaticPricing`] is the default.

/// Call log and aggregation.
pub mod accountant;
/// Provider pricing.
pub mod pricing;

pub use accountant::{Accountant, ProviderCall, ProviderCallRecord, RunningTotal, UsageFilter};
pub use pricing::{nanos_to_usd, PricingTable, ProviderPricing, StaticPricing, NANOS_PER_USD};
