//! End-to-end orchestration tests.
//!
//! Drives real task graphs through the orchestrator with scripted agents:
//! failure propagation, fan-in ordering, retries with usage accounting,
//! deadlines, per-call timeouts, rate limiting and concurrency limits.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use paperflow_agent::{
    Agent, AgentDescriptor, AgentFactory, AgentOutput, AgentRegistry, AgentRequest, RetryPolicy,
    UserContext,
};
use paperflow_core::{AgentError, Capability, PaperflowResult, ProviderId, TokenUsage};
use paperflow_orchestrator::*;
use paperflow_security::{BucketConfig, RateLimiter};
use paperflow_usage::{Accountant, ProviderPricing, StaticPricing, UsageFilter};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Scripted agents
// ---------------------------------------------------------------------------

/// Replays a script of results, then repeats the last one. Counts calls.
struct Scripted {
    script: Mutex<VecDeque<Result<Value, AgentError>>>,
    last: Mutex<Option<Result<Value, AgentError>>>,
    delay: Duration,
    calls: AtomicU32,
    seen: Mutex<Vec<AgentRequest>>,
}

impl Scripted {
    fn new(script: Vec<Result<Value, AgentError>>) -> Arc<Self> {
        Self::delayed(script, Duration::ZERO)
    }

    fn ok(payload: Value) -> Arc<Self> {
        Self::new(vec![Ok(payload)])
    }

    fn delayed(script: Vec<Result<Value, AgentError>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            delay,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for Scripted {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = {
            let mut script = self.script.lock();
            match script.pop_front() {
                Some(step) => {
                    *self.last.lock() = Some(step.clone());
                    step
                }
                None => self
                    .last
                    .lock()
                    .clone()
                    .unwrap_or_else(|| Ok(Value::Null)),
            }
        };
        next.map(|payload| AgentOutput::new(payload).with_usage(TokenUsage::new(100, 20)))
    }
}

/// Tracks how many calls overlap.
struct Gauge {
    current: AtomicU32,
    peak: AtomicU32,
}

#[async_trait]
impl Agent for Gauge {
    async fn invoke(&self, _request: AgentRequest) -> Result<AgentOutput, AgentError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(AgentOutput::new(json!("ok")))
    }
}

struct EchoUserFactory;

struct EchoUser(String);

#[async_trait]
impl Agent for EchoUser {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        Ok(AgentOutput::new(json!({
            "reply": format!("{} said {}", self.0, request.input_str("message").unwrap_or("")),
        })))
    }
}

#[async_trait]
impl AgentFactory for EchoUserFactory {
    async fn create(&self, user: &UserContext) -> PaperflowResult<Arc<dyn Agent>> {
        Ok(Arc::new(EchoUser(user.user_id.clone())))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn register(registry: &AgentRegistry, capability: Capability, agent: Arc<dyn Agent>) {
    registry
        .register_system(AgentDescriptor::system(capability), agent)
        .unwrap();
}

fn register_with_provider(
    registry: &AgentRegistry,
    capability: Capability,
    provider: &str,
    agent: Arc<dyn Agent>,
) {
    registry
        .register_system(
            AgentDescriptor::system(capability).with_provider(provider),
            agent,
        )
        .unwrap();
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
    }
}

fn orchestrator(registry: AgentRegistry) -> Orchestrator {
    orchestrator_with(registry, RateLimiter::new(), Accountant::unpriced())
}

fn orchestrator_with(
    registry: AgentRegistry,
    limiter: RateLimiter,
    accountant: Accountant,
) -> Orchestrator {
    Orchestrator::new(Arc::new(registry), Arc::new(limiter), Arc::new(accountant))
        .with_retry_policy(fast_retries())
}

fn linear_graph() -> TaskGraph {
    TaskGraph::builder()
        .task(TaskSpec::new("extract", Capability::TextExtraction).input(json!({"paper_id": "p1"})))
        .task(TaskSpec::new("summarize", Capability::Summarization).after(["extract"]))
        .task(TaskSpec::new("store", Capability::Storage).after(["summarize"]))
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_permanent_failure_skips_downstream_without_calls() {
    let registry = AgentRegistry::new();
    let extract = Scripted::new(vec![Err(AgentError::permanent("unreadable pdf"))]);
    let summarize = Scripted::ok(json!({"text": "summary"}));
    let store = Scripted::ok(json!({"path": "/tmp/x"}));
    register(&registry, Capability::TextExtraction, extract.clone());
    register(&registry, Capability::Summarization, summarize.clone());
    register(&registry, Capability::Storage, store.clone());

    let orch = orchestrator(registry);
    let result = orch
        .run_graph("paper_processing", linear_graph(), ExecutionOptions::new())
        .await;

    assert_eq!(result.status, WorkflowStatus::PartiallyFailed);
    assert!(!result.timed_out);
    assert!(result.outputs.is_empty());
    assert_eq!(extract.calls(), 1);
    assert_eq!(summarize.calls(), 0);
    assert_eq!(store.calls(), 0);

    let extract_failure = result.failure("extract").unwrap();
    assert_eq!(extract_failure.state, TaskState::Failed);
    assert!(extract_failure.reason.contains("unreadable pdf"));
    for id in ["summarize", "store"] {
        let failure = result.failure(id).unwrap();
        assert_eq!(failure.state, TaskState::Skipped);
        assert_eq!(failure.attempts, 0);
        assert!(failure.reason.contains("extract"));
    }
}

async fn run_fan_in(crossref_delay: Duration, s2_delay: Duration) {
    let registry = AgentRegistry::new();
    let crossref = Scripted::delayed(vec![Ok(json!({"metadata": {"title": "C"}}))], crossref_delay);
    let s2 = Scripted::delayed(vec![Ok(json!({"metadata": {"title": "S"}}))], s2_delay);
    let merge = Scripted::ok(json!({"merged": true}));
    register(&registry, Capability::CrossrefLookup, crossref.clone());
    register(&registry, Capability::SemanticScholarLookup, s2.clone());
    register(&registry, Capability::MetadataMerge, merge.clone());

    let graph = TaskGraph::builder()
        .task(TaskSpec::new("lookup_crossref", Capability::CrossrefLookup))
        .task(TaskSpec::new("lookup_semantic_scholar", Capability::SemanticScholarLookup))
        .task(
            TaskSpec::new("merge_metadata", Capability::MetadataMerge)
                .after(["lookup_crossref", "lookup_semantic_scholar"]),
        )
        .build()
        .unwrap();

    let result = orchestrator(registry)
        .run_graph("metadata_enrichment", graph, ExecutionOptions::new())
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(merge.calls(), 1);
    let seen = merge.seen.lock();
    let upstream = &seen[0].upstream;
    assert_eq!(upstream["lookup_crossref"]["metadata"]["title"], "C");
    assert_eq!(upstream["lookup_semantic_scholar"]["metadata"]["title"], "S");
}

#[tokio::test(start_paused = true)]
async fn test_merge_waits_for_both_branches() {
    run_fan_in(Duration::from_millis(50), Duration::from_millis(500)).await;
    run_fan_in(Duration::from_millis(500), Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_and_metered() {
    let registry = AgentRegistry::new();
    let flaky = Scripted::new(vec![
        Err(AgentError::transient("503 from provider")),
        Err(AgentError::transient("connection reset")),
        Ok(json!({"text": "finally"})),
    ]);
    register_with_provider(&registry, Capability::Summarization, "openai", flaky.clone());

    let pricing = StaticPricing::new().with_provider(
        "openai",
        ProviderPricing::from_usd_per_1k(0.001, 0.002),
    );
    let accountant = Accountant::new(Arc::new(pricing));
    let orch = orchestrator_with(registry, RateLimiter::new(), accountant);

    let graph = TaskGraph::builder()
        .task(TaskSpec::new("summarize", Capability::Summarization).max_retries(2))
        .build()
        .unwrap();
    let correlation_id = graph.correlation_id();
    let started = tokio::time::Instant::now();
    let result = orch.run_graph("adhoc", graph, ExecutionOptions::new()).await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.outputs["summarize"]["text"], "finally");
    assert_eq!(flaky.calls(), 3);
    // backoff 100ms then 200ms
    assert!(started.elapsed() >= Duration::from_millis(300));

    let records = orch
        .accountant()
        .records(&UsageFilter::all().correlation(correlation_id));
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.task_id.as_deref() == Some("summarize")));
    assert_eq!(records.iter().filter(|r| !r.success).count(), 2);

    assert_eq!(result.usage.request_count, 3);
    assert_eq!(result.usage.failed_count, 2);
    assert_eq!(result.usage.input_tokens, 100);
    assert_eq!(result.usage.output_tokens, 20);
    // 100 * 1_000_000 + 20 * 2_000_000 = 140_000_000 / 1000
    assert_eq!(result.usage.cost_nanos, 140_000);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let registry = AgentRegistry::new();
    let broken = Scripted::new(vec![Err(AgentError::transient("503"))]);
    register(&registry, Capability::Summarization, broken.clone());
    let orch = orchestrator(registry);

    let graph = TaskGraph::builder()
        .task(TaskSpec::new("summarize", Capability::Summarization).max_retries(1))
        .build()
        .unwrap();
    let result = orch.run_graph("adhoc", graph, ExecutionOptions::new()).await;

    assert_eq!(broken.calls(), 2);
    let failure = result.failure("summarize").unwrap();
    assert_eq!(failure.state, TaskState::Failed);
    assert_eq!(failure.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_required_task_failure_fails_workflow_but_keeps_outputs() {
    let registry = AgentRegistry::new();
    register(&registry, Capability::CrossrefLookup, Scripted::ok(json!({"metadata": {"title": "T"}})));
    register(
        &registry,
        Capability::Summarization,
        Scripted::new(vec![Err(AgentError::permanent("context too long"))]),
    );
    let orch = orchestrator(registry);

    let graph = TaskGraph::builder()
        .task(TaskSpec::new("lookup_crossref", Capability::CrossrefLookup))
        .task(TaskSpec::new("summarize", Capability::Summarization).required())
        .build()
        .unwrap();
    let result = orch.run_graph("adhoc", graph, ExecutionOptions::new()).await;

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.outputs["lookup_crossref"]["metadata"]["title"], "T");
    assert!(result.failure("summarize").unwrap().required);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_drains_in_flight_and_skips_rest() {
    let registry = AgentRegistry::new();
    let slow = Scripted::delayed(vec![Ok(json!({"text": "late"}))], Duration::from_secs(5));
    let summarize = Scripted::ok(json!("never"));
    register(&registry, Capability::TextExtraction, slow.clone());
    register(&registry, Capability::Summarization, summarize.clone());
    register(&registry, Capability::Storage, Scripted::ok(json!("never")));

    let orch = orchestrator(registry);
    let options = ExecutionOptions::new()
        .with_timeout(Duration::from_secs(1))
        .with_call_timeout(Duration::from_secs(30));
    let result = orch.run_graph("paper_processing", linear_graph(), options).await;

    assert!(result.timed_out);
    assert_eq!(result.status, WorkflowStatus::PartiallyFailed);
    // the in-flight call was allowed to finish
    assert_eq!(result.outputs["extract"]["text"], "late");
    assert_eq!(summarize.calls(), 0);
    let skipped = result.failure("summarize").unwrap();
    assert_eq!(skipped.state, TaskState::Skipped);
    assert!(skipped.reason.contains("deadline"));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_on_workflow_with_required_tasks_is_partial() {
    let registry = AgentRegistry::new();
    let slow = |payload: Value| Scripted::delayed(vec![Ok(payload)], Duration::from_secs(5));
    register(&registry, Capability::TextExtraction, slow(json!({"text": "body"})));
    register(&registry, Capability::Summarization, slow(json!({"text": "summary"})));
    register(&registry, Capability::CrossrefLookup, slow(json!({"metadata": {"title": "T"}})));
    register(&registry, Capability::SemanticScholarLookup, slow(json!({"metadata": {"title": "T"}})));
    register(&registry, Capability::MetadataMerge, slow(json!({"metadata": {"title": "T"}})));
    register(&registry, Capability::Storage, slow(json!({"path": "out.json"})));

    let orch = orchestrator(registry);
    let options = ExecutionOptions::new()
        .with_timeout(Duration::from_secs(1))
        .with_call_timeout(Duration::from_secs(30));
    let result = orch
        .execute("paper_processing", &json!({"paper_id": "p"}), options)
        .await
        .unwrap();

    assert!(result.timed_out);
    assert_eq!(result.status, WorkflowStatus::PartiallyFailed);
    assert_eq!(result.outputs["extract"]["text"], "body");
    let summarize = result.failure("summarize").unwrap();
    assert!(summarize.required);
    assert_eq!(summarize.state, TaskState::Skipped);
    assert!(summarize.reason.contains("deadline"));
}

#[tokio::test(start_paused = true)]
async fn test_required_failure_before_deadline_still_fails() {
    let registry = AgentRegistry::new();
    register(
        &registry,
        Capability::TextExtraction,
        Scripted::new(vec![Err(AgentError::permanent("unreadable pdf"))]),
    );
    register(
        &registry,
        Capability::CrossrefLookup,
        Scripted::delayed(vec![Ok(json!({"metadata": {}}))], Duration::from_secs(5)),
    );
    let orch = orchestrator(registry);

    let graph = TaskGraph::builder()
        .task(TaskSpec::new("extract", Capability::TextExtraction).required())
        .task(TaskSpec::new("lookup_crossref", Capability::CrossrefLookup))
        .task(TaskSpec::new("later", Capability::CrossrefLookup).after(["lookup_crossref"]))
        .build()
        .unwrap();
    let options = ExecutionOptions::new()
        .with_timeout(Duration::from_secs(1))
        .with_call_timeout(Duration::from_secs(30));
    let result = orch.run_graph("adhoc", graph, options).await;

    assert!(result.timed_out);
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.failure("extract").unwrap().state, TaskState::Failed);
    assert_eq!(result.failure("later").unwrap().state, TaskState::Skipped);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_cancels_pending_retry() {
    let registry = AgentRegistry::new();
    let broken = Scripted::new(vec![Err(AgentError::transient("503"))]);
    register(&registry, Capability::Summarization, broken.clone());
    let orch = Orchestrator::new(
        Arc::new(registry),
        Arc::new(RateLimiter::new()),
        Arc::new(Accountant::unpriced()),
    )
    .with_retry_policy(RetryPolicy {
        max_retries: 5,
        backoff_base_ms: 10_000,
        backoff_max_ms: 60_000,
    })
    .with_workflow_timeout(Duration::from_secs(2));

    let graph = TaskGraph::builder()
        .task(TaskSpec::new("summarize", Capability::Summarization))
        .build()
        .unwrap();
    let started = tokio::time::Instant::now();
    let result = orch.run_graph("adhoc", graph, ExecutionOptions::new()).await;

    assert!(result.timed_out);
    assert_eq!(broken.calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.failure("summarize").unwrap().state, TaskState::Skipped);
}

#[tokio::test(start_paused = true)]
async fn test_call_timeout_consumes_retries() {
    let registry = AgentRegistry::new();
    let hung = Scripted::delayed(vec![Ok(json!("too late"))], Duration::from_secs(60));
    register(&registry, Capability::Summarization, hung.clone());
    let orch = orchestrator(registry).with_call_timeout(Duration::from_secs(1));

    let graph = TaskGraph::builder()
        .task(TaskSpec::new("summarize", Capability::Summarization).max_retries(1))
        .build()
        .unwrap();
    let result = orch.run_graph("adhoc", graph, ExecutionOptions::new()).await;

    assert_eq!(hung.calls(), 2);
    let failure = result.failure("summarize").unwrap();
    assert_eq!(failure.state, TaskState::Failed);
    assert!(failure.reason.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_provider_rate_limit_spaces_calls() {
    let registry = AgentRegistry::new();
    let agent = Scripted::ok(json!("ok"));
    register_with_provider(&registry, Capability::Summarization, "openai", agent.clone());
    let limiter = RateLimiter::new().with_provider("openai", BucketConfig::new(1.0, 1.0));
    let orch = orchestrator_with(registry, limiter, Accountant::unpriced());

    let graph = TaskGraph::builder()
        .task(TaskSpec::new("a", Capability::Summarization))
        .task(TaskSpec::new("b", Capability::Summarization))
        .task(TaskSpec::new("c", Capability::Summarization))
        .build()
        .unwrap();
    let started = tokio::time::Instant::now();
    let result = orch.run_graph("adhoc", graph, ExecutionOptions::new()).await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(agent.calls(), 3);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(
        orch.accountant()
            .aggregate(&UsageFilter::all().provider(ProviderId::from("openai")))
            .request_count,
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_agent_concurrency_limit_respected() {
    let registry = AgentRegistry::new();
    let gauge = Arc::new(Gauge {
        current: AtomicU32::new(0),
        peak: AtomicU32::new(0),
    });
    registry
        .register_system(
            AgentDescriptor::system(Capability::Summarization).with_concurrency(2),
            gauge.clone(),
        )
        .unwrap();
    let orch = orchestrator(registry);

    let mut builder = TaskGraph::builder();
    for n in 0..6 {
        builder.add_task(TaskSpec::new(format!("summarize_{n}"), Capability::Summarization));
    }
    let result = orch
        .run_graph("adhoc", builder.build().unwrap(), ExecutionOptions::new())
        .await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.outputs.len(), 6);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_chat_workflow_uses_user_scoped_agent() {
    let registry = AgentRegistry::new();
    registry
        .register_user_scoped(
            AgentDescriptor::user(Capability::Chat),
            Arc::new(EchoUserFactory),
        )
        .unwrap();
    let orch = orchestrator(registry);

    let result = orch
        .execute(
            "chat",
            &json!({"message": "hello"}),
            ExecutionOptions::new().for_user("alice"),
        )
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.outputs["chat"]["reply"], "alice said hello");
    assert!(orch.registry().has_session("alice").await);

    let anonymous = orch
        .execute("chat", &json!({"message": "hello"}), ExecutionOptions::new())
        .await
        .unwrap();
    assert_eq!(anonymous.status, WorkflowStatus::Failed);
    assert!(anonymous
        .failure("chat")
        .unwrap()
        .reason
        .contains("user context"));

    assert_eq!(orch.registry().end_session("alice").await, 1);
}

#[tokio::test]
async fn test_paper_processing_end_to_end() {
    let registry = AgentRegistry::new();
    register(&registry, Capability::TextExtraction, Scripted::ok(json!({"text": "full text"})));
    register(&registry, Capability::Summarization, Scripted::ok(json!({"text": "summary"})));
    register(&registry, Capability::CrossrefLookup, Scripted::ok(json!({"metadata": {"title": "T"}})));
    register(
        &registry,
        Capability::SemanticScholarLookup,
        Scripted::new(vec![Err(AgentError::permanent("404"))]),
    );
    let merge = Scripted::ok(json!({"metadata": {"title": "T"}}));
    register(&registry, Capability::MetadataMerge, merge.clone());
    let store = Scripted::ok(json!({"path": "out.json"}));
    register(&registry, Capability::Storage, store.clone());

    let orch = orchestrator(registry);
    let result = orch
        .execute("paper_processing", &json!({"paper_id": "10.1/x"}), ExecutionOptions::new())
        .await
        .unwrap();

    // one optional lookup failed; everything else ran
    assert_eq!(result.status, WorkflowStatus::PartiallyFailed);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(merge.seen.lock()[0].upstream.len(), 1);
    let seen = store.seen.lock();
    let store_request = &seen[0];
    assert!(store_request.upstream.contains_key("summarize"));
    assert!(store_request.upstream.contains_key("merge_metadata"));
    assert_eq!(store_request.correlation_id, result.correlation_id);
}
