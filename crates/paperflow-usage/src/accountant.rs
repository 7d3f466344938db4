use crate::pricing::{nanos_to_usd, PricingTable, StaticPricing};
use chrono::{DateTime, Utc};
use paperflow_core::{Capability, PaperflowError, PaperflowResult, ProviderId, TokenUsage};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Raw data for one provider call, as reported by the caller.
///
/// Token counts are signed so malformed input from a provider adapter can be
/// detected and rejected instead of wrapping.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    /// Provider that served the call.
    pub provider: ProviderId,
    /// Capability of the agent that made it.
    pub agent_type: Capability,
    /// User the call is billed to, if any.
    pub user_id: Option<String>,
    /// Workflow run the call belongs to.
    pub correlation_id: Option<Uuid>,
    /// Task within that run.
    pub task_id: Option<String>,
    /// Prompt tokens; must not be negative.
    pub input_tokens: i64,
    /// Completion tokens; must not be negative.
    pub output_tokens: i64,
    /// Wall-clock time of the call.
    pub latency: Duration,
    /// Whether the provider returned a usable response.
    pub success: bool,
    /// Defaults to the recording time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ProviderCall {
    /// A successful call with zero tokens; adjust with the builder methods.
    pub fn new(provider: impl Into<ProviderId>, agent_type: Capability) -> Self {
        Self {
            provider: provider.into(),
            agent_type,
            user_id: None,
            correlation_id: None,
            task_id: None,
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::ZERO,
            success: true,
            timestamp: None,
        }
    }

    /// Set input and output token counts.
    pub fn tokens(mut self, input: i64, output: i64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    /// Take token counts from a provider response, clamping to `i64::MAX`.
    pub fn usage(self, usage: &TokenUsage) -> Self {
        let input = i64::try_from(usage.input_tokens).unwrap_or(i64::MAX);
        let output = i64::try_from(usage.output_tokens).unwrap_or(i64::MAX);
        self.tokens(input, output)
    }

    /// Bill the call to a user.
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach the call to a workflow run and task.
    pub fn correlation(mut self, correlation_id: Uuid, task_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id);
        self.task_id = Some(task_id.into());
        self
    }

    /// Set the observed latency.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Mark the call as failed.
    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    /// Override the recording timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// An immutable, priced call record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCallRecord {
    /// Position in the append-only log.
    pub seq: u64,
    /// Provider that served the call.
    pub provider: ProviderId,
    /// Capability of the calling agent.
    pub agent_type: Capability,
    /// User the call is billed to.
    pub user_id: Option<String>,
    /// Workflow run the call belongs to.
    pub correlation_id: Option<Uuid>,
    /// Task within that run.
    pub task_id: Option<String>,
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Price in nano-dollars at recording time.
    pub cost_nanos: u64,
    /// Latency in whole milliseconds.
    pub latency_ms: u64,
    /// Whether the call succeeded.
    pub success: bool,
    /// When the call was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate over a set of call records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTotal {
    /// Sum of prompt tokens.
    pub input_tokens: u64,
    /// Sum of completion tokens.
    pub output_tokens: u64,
    /// Sum of cost in nano-dollars.
    pub cost_nanos: u64,
    /// Number of records, failed ones included.
    pub request_count: u64,
    /// Number of failed records.
    pub failed_count: u64,
}

impl RunningTotal {
    /// Input plus output tokens, saturating.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Total cost in US dollars.
    pub fn cost_usd(&self) -> f64 {
        nanos_to_usd(self.cost_nanos)
    }

    fn add(&mut self, record: &ProviderCallRecord) {
        self.input_tokens = self.input_tokens.saturating_add(record.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(record.output_tokens);
        self.cost_nanos = self.cost_nanos.saturating_add(record.cost_nanos);
        self.request_count += 1;
        if !record.success {
            self.failed_count += 1;
        }
    }
}

/// Selects records for aggregation. Unset fields match everything; the time
/// range is half-open, `[from, to)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageFilter {
    /// Only this provider.
    pub provider: Option<ProviderId>,
    /// Only this agent capability.
    pub agent_type: Option<Capability>,
    /// Only this user.
    pub user_id: Option<String>,
    /// Only this workflow run.
    pub correlation_id: Option<Uuid>,
    /// Inclusive lower bound on the record timestamp.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the record timestamp.
    pub to: Option<DateTime<Utc>>,
}

impl UsageFilter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one provider.
    pub fn provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Restrict to one agent capability.
    pub fn agent_type(mut self, agent_type: Capability) -> Self {
        self.agent_type = Some(agent_type);
        self
    }

    /// Restrict to one user.
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Restrict to one workflow run.
    pub fn correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Restrict to records in `[from, to)`.
    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Whether `record` passes every set criterion.
    pub fn matches(&self, record: &ProviderCallRecord) -> bool {
        self.provider.as_ref().map_or(true, |p| &record.provider == p)
            && self.agent_type.map_or(true, |a| record.agent_type == a)
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| record.user_id.as_ref() == Some(u))
            && self
                .correlation_id
                .map_or(true, |c| record.correlation_id == Some(c))
            && self.from.map_or(true, |from| record.timestamp >= from)
            && self.to.map_or(true, |to| record.timestamp < to)
    }

    /// Only the provider is set, so the per-provider index answers it.
    fn is_provider_only(&self) -> bool {
        self.provider.is_some()
            && self.agent_type.is_none()
            && self.user_id.is_none()
            && self.correlation_id.is_none()
            && self.from.is_none()
            && self.to.is_none()
    }
}

#[derive(Default)]
struct Ledger {
    records: Vec<ProviderCallRecord>,
    by_provider: HashMap<ProviderId, RunningTotal>,
}

/// Append-only log of provider calls.
///
/// Appending a record and updating the per-provider index happen under one
/// write lock; every query runs under one read lock, so readers always see a
/// whole number of records.
pub struct Accountant {
    pricing: Arc<dyn PricingTable>,
    ledger: RwLock<Ledger>,
}

impl Accountant {
    /// An empty ledger priced by `pricing`.
    pub fn new(pricing: Arc<dyn PricingTable>) -> Self {
        Self {
            pricing,
            ledger: RwLock::new(Ledger::default()),
        }
    }

    /// An accountant that prices every call at zero.
    pub fn unpriced() -> Self {
        Self::new(Arc::new(StaticPricing::new()))
    }

    /// Validate, price and append a call.
    pub fn record(&self, call: ProviderCall) -> PaperflowResult<ProviderCallRecord> {
        if call.provider.as_str().trim().is_empty() {
            return Err(PaperflowError::InvalidUsageRecord(
                "provider id is empty".to_string(),
            ));
        }
        let input_tokens = u64::try_from(call.input_tokens).map_err(|_| {
            PaperflowError::InvalidUsageRecord(format!(
                "negative input token count {}",
                call.input_tokens
            ))
        })?;
        let output_tokens = u64::try_from(call.output_tokens).map_err(|_| {
            PaperflowError::InvalidUsageRecord(format!(
                "negative output token count {}",
                call.output_tokens
            ))
        })?;

        let usage = TokenUsage::new(input_tokens, output_tokens);
        let cost_nanos = self.pricing.cost_nanos(&call.provider, &usage);
        let timestamp = call.timestamp.unwrap_or_else(Utc::now);

        let record = {
            let mut ledger = self.ledger.write();
            let record = ProviderCallRecord {
                seq: ledger.records.len() as u64,
                provider: call.provider,
                agent_type: call.agent_type,
                user_id: call.user_id,
                correlation_id: call.correlation_id,
                task_id: call.task_id,
                input_tokens,
                output_tokens,
                cost_nanos,
                latency_ms: call.latency.as_millis() as u64,
                success: call.success,
                timestamp,
            };
            ledger
                .by_provider
                .entry(record.provider.clone())
                .or_default()
                .add(&record);
            ledger.records.push(record.clone());
            record
        };

        debug!(
            provider = %record.provider,
            agent_type = %record.agent_type,
            input_tokens,
            output_tokens,
            cost_nanos,
            success = record.success,
            "Provider call recorded"
        );
        Ok(record)
    }

    /// Totals over every record the filter matches.
    pub fn aggregate(&self, filter: &UsageFilter) -> RunningTotal {
        let ledger = self.ledger.read();
        if filter.is_provider_only() {
            return filter
                .provider
                .as_ref()
                .and_then(|p| ledger.by_provider.get(p).copied())
                .unwrap_or_default();
        }
        let mut total = RunningTotal::default();
        for record in ledger.records.iter().filter(|r| filter.matches(r)) {
            total.add(record);
        }
        total
    }

    /// Totals per provider over the filtered records.
    pub fn by_provider(&self, filter: &UsageFilter) -> BTreeMap<String, RunningTotal> {
        self.breakdown(filter, |r| Some(r.provider.to_string()))
    }

    /// Totals per agent type over the filtered records.
    pub fn by_agent_type(&self, filter: &UsageFilter) -> BTreeMap<String, RunningTotal> {
        self.breakdown(filter, |r| Some(r.agent_type.to_string()))
    }

    /// Totals per user over the filtered records; system calls are skipped.
    pub fn by_user(&self, filter: &UsageFilter) -> BTreeMap<String, RunningTotal> {
        self.breakdown(filter, |r| r.user_id.clone())
    }

    fn breakdown<F>(&self, filter: &UsageFilter, key: F) -> BTreeMap<String, RunningTotal>
    where
        F: Fn(&ProviderCallRecord) -> Option<String>,
    {
        let ledger = self.ledger.read();
        let mut out: BTreeMap<String, RunningTotal> = BTreeMap::new();
        for record in ledger.records.iter().filter(|r| filter.matches(r)) {
            if let Some(k) = key(record) {
                out.entry(k).or_default().add(record);
            }
        }
        out
    }

    /// Copies of the filtered records, in log order.
    pub fn records(&self, filter: &UsageFilter) -> Vec<ProviderCallRecord> {
        let ledger = self.ledger.read();
        ledger
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Number of recorded calls.
    pub fn len(&self) -> usize {
        self.ledger.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Accountant {
    fn default() -> Self {
        Self::unpriced()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pricing::ProviderPricing;
    use chrono::TimeZone;

    fn priced() -> Accountant {
        let pricing = StaticPricing::new()
            .with_provider("openai", ProviderPricing::from_usd_per_1k(0.001, 0.002))
            .with_provider("anthropic", ProviderPricing::from_usd_per_1k(0.003, 0.015));
        Accountant::new(Arc::new(pricing))
    }

    #[test]
    fn test_record_computes_cost() {
        let acct = priced();
        let record = acct
            .record(ProviderCall::new("openai", Capability::Summarization).tokens(2000, 1000))
            .unwrap();
        // 2000 * 1_000_000 + 1000 * 2_000_000 = 4e9 / 1000
        assert_eq!(record.cost_nanos, 4_000_000);
        assert_eq!(record.seq, 0);
        assert_eq!(acct.len(), 1);
    }

    #[test]
    fn test_negative_tokens_rejected_and_not_counted() {
        let acct = priced();
        acct.record(ProviderCall::new("openai", Capability::Chat).tokens(10, 10))
            .unwrap();
        let err = acct
            .record(ProviderCall::new("openai", Capability::Chat).tokens(-5, 10))
            .unwrap_err();
        assert!(matches!(err, PaperflowError::InvalidUsageRecord(_)));

        let total = acct.aggregate(&UsageFilter::all().provider("openai"));
        assert_eq!(total.request_count, 1);
        assert_eq!(total.input_tokens, 10);
    }

    #[test]
    fn test_empty_provider_rejected() {
        let acct = priced();
        assert!(acct
            .record(ProviderCall::new("  ", Capability::Chat))
            .is_err());
        assert!(acct.is_empty());
    }

    #[test]
    fn test_unknown_provider_is_recorded_at_zero_cost() {
        let acct = priced();
        let record = acct
            .record(ProviderCall::new("groq", Capability::Comparison).tokens(500, 500))
            .unwrap();
        assert_eq!(record.cost_nanos, 0);
        assert_eq!(acct.aggregate(&UsageFilter::all()).total_tokens(), 1000);
    }

    #[test]
    fn test_aggregate_sums_match_records() {
        let acct = priced();
        let calls = [
            ("openai", 100, 50, true),
            ("openai", 300, 20, false),
            ("anthropic", 1000, 400, true),
            ("openai", 7, 3, true),
        ];
        for (provider, i, o, ok) in calls {
            let mut call = ProviderCall::new(provider, Capability::Summarization).tokens(i, o);
            if !ok {
                call = call.failed();
            }
            acct.record(call).unwrap();
        }

        let expected_cost: u64 = acct
            .records(&UsageFilter::all().provider("openai"))
            .iter()
            .map(|r| r.cost_nanos)
            .sum();
        let openai = acct.aggregate(&UsageFilter::all().provider("openai"));
        assert_eq!(openai.input_tokens, 407);
        assert_eq!(openai.output_tokens, 73);
        assert_eq!(openai.request_count, 3);
        assert_eq!(openai.failed_count, 1);
        assert_eq!(openai.cost_nanos, expected_cost);

        // index and scan agree
        let scanned = acct.by_provider(&UsageFilter::all());
        assert_eq!(scanned["openai"], openai);
        assert_eq!(scanned["anthropic"].request_count, 1);
    }

    #[test]
    fn test_filters_by_user_agent_and_correlation() {
        let acct = priced();
        let run = Uuid::new_v4();
        acct.record(
            ProviderCall::new("openai", Capability::Chat)
                .tokens(10, 10)
                .user("alice"),
        )
        .unwrap();
        acct.record(
            ProviderCall::new("openai", Capability::Summarization)
                .tokens(20, 20)
                .user("bob")
                .correlation(run, "summarize"),
        )
        .unwrap();
        acct.record(ProviderCall::new("anthropic", Capability::Summarization).tokens(30, 30))
            .unwrap();

        assert_eq!(acct.aggregate(&UsageFilter::all().user("alice")).input_tokens, 10);
        assert_eq!(
            acct.aggregate(&UsageFilter::all().agent_type(Capability::Summarization))
                .request_count,
            2
        );
        assert_eq!(acct.aggregate(&UsageFilter::all().correlation(run)).input_tokens, 20);

        let users = acct.by_user(&UsageFilter::all());
        assert_eq!(users.len(), 2);
        assert!(users.contains_key("alice"));

        let agents = acct.by_agent_type(&UsageFilter::all().provider("openai"));
        assert_eq!(agents["chat"].request_count, 1);
        assert_eq!(agents["summarization"].request_count, 1);
    }

    #[test]
    fn test_time_range_is_half_open() {
        let acct = priced();
        let t = |h| Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).unwrap();
        for hour in [8, 9, 10] {
            acct.record(
                ProviderCall::new("openai", Capability::Chat)
                    .tokens(1, 0)
                    .at(t(hour)),
            )
            .unwrap();
        }
        let window = acct.aggregate(&UsageFilter::all().between(t(9), t(10)));
        assert_eq!(window.request_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_recording_is_consistent() {
        let acct = Arc::new(priced());
        let mut handles = Vec::new();
        for worker in 0..8i64 {
            let acct = acct.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250i64 {
                    acct.record(
                        ProviderCall::new("anthropic", Capability::Comparison)
                            .tokens(worker + i, i),
                    )
                    .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let records = acct.records(&UsageFilter::all());
        assert_eq!(records.len(), 2000);
        let expected_in: u64 = records.iter().map(|r| r.input_tokens).sum();
        let expected_cost: u64 = records.iter().map(|r| r.cost_nanos).sum();
        let total = acct.aggregate(&UsageFilter::all().provider("anthropic"));
        assert_eq!(total.input_tokens, expected_in);
        assert_eq!(total.cost_nanos, expected_cost);
        assert_eq!(total.request_count, 2000);
    }
}
