use crate::graph::TaskGraph;
use crate::types::{
    ExecutionOptions, TaskFailure, TaskOutcome, TaskState, WorkflowResult, WorkflowStatus,
};
use crate::workflows::{WorkflowBuilder, WorkflowCatalog};
use chrono::Utc;
use futures_util::FutureExt;
use paperflow_agent::{AgentRegistry, AgentRequest, RetryPolicy, UserContext};
use paperflow_core::config::OrchestratorConfig;
use paperflow_core::{Capability, PaperflowResult, TokenUsage};
use paperflow_security::{AcquireMode, RateLimiter};
use paperflow_usage::{Accountant, ProviderCall, UsageFilter};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Drives workflow task graphs to completion.
///
/// Ready tasks are dispatched concurrently onto a `JoinSet`; completions are
/// applied to the graph one at a time by the dispatch loop, which is the only
/// writer of the graph. Transient failures come back after an exponential
/// backoff. When the workflow deadline passes nothing new is dispatched,
/// in-flight calls drain, pending retries are dropped and every unfinished
/// task is skipped.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    limiter: Arc<RateLimiter>,
    accountant: Arc<Accountant>,
    catalog: RwLock<WorkflowCatalog>,
    policy: RetryPolicy,
    call_timeout: Duration,
    workflow_timeout: Duration,
}

struct Attempt {
    registry: Arc<AgentRegistry>,
    limiter: Arc<RateLimiter>,
    accountant: Arc<Accountant>,
    user: Option<UserContext>,
    request: AgentRequest,
    call_timeout: Duration,
}

struct AttemptReport {
    task_id: String,
    outcome: TaskOutcome,
}

impl Orchestrator {
    /// Create an orchestrator with the built-in workflows and default timings.
    pub fn new(
        registry: Arc<AgentRegistry>,
        limiter: Arc<RateLimiter>,
        accountant: Arc<Accountant>,
    ) -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            registry,
            limiter,
            accountant,
            catalog: RwLock::new(WorkflowCatalog::with_builtins()),
            policy: RetryPolicy::from(&defaults),
            call_timeout: defaults.call_timeout(),
            workflow_timeout: defaults.workflow_timeout(),
        }
    }

    /// Apply retry and timeout settings from configuration.
    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.policy = RetryPolicy::from(config);
        self.call_timeout = config.call_timeout();
        self.workflow_timeout = config.workflow_timeout();
        self
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Default per-call timeout for tasks that do not set one.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Default overall deadline for runs that do not set one.
    pub fn with_workflow_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_timeout = timeout;
        self
    }

    /// Agents this orchestrator dispatches to.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Ledger every provider call is recorded in.
    pub fn accountant(&self) -> &Arc<Accountant> {
        &self.accountant
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Add or replace a workflow builder.
    pub fn register_workflow(&self, name: impl Into<String>, builder: impl WorkflowBuilder + 'static) {
        let name = name.into();
        info!(workflow = %name, "Registered workflow");
        self.catalog.write().register(name, builder);
    }

    /// Names of every registered workflow, sorted.
    pub fn workflows(&self) -> Vec<String> {
        self.catalog.read().names()
    }

    /// Build a workflow's task graph without running it.
    pub fn plan(&self, workflow: &str, params: &Value) -> PaperflowResult<TaskGraph> {
        let mut graph = self.catalog.read().build(workflow, params)?;
        graph.set_default_max_retries(self.policy.max_retries);
        Ok(graph)
    }

    /// Build and run a named workflow.
    ///
    /// Only graph construction can fail; task failures are reported in the
    /// returned [`WorkflowResult`].
    pub async fn execute(
        &self,
        workflow: &str,
        params: &Value,
        options: ExecutionOptions,
    ) -> PaperflowResult<WorkflowResult> {
        let graph = self.plan(workflow, params)?;
        Ok(self.run_graph(workflow, graph, options).await)
    }

    /// Run a graph the caller built.
    pub async fn run_graph(
        &self,
        workflow: impl Into<String>,
        mut graph: TaskGraph,
        options: ExecutionOptions,
    ) -> WorkflowResult {
        let workflow = workflow.into();
        let correlation_id = graph.correlation_id();
        let started_at = Utc::now();
        let timeout = options.timeout.unwrap_or(self.workflow_timeout);
        let call_timeout = options.call_timeout.unwrap_or(self.call_timeout);
        let deadline = tokio::time::sleep_until(Instant::now() + timeout);
        tokio::pin!(deadline);

        info!(
            workflow = %workflow,
            correlation_id = %correlation_id,
            tasks = graph.len(),
            user = options.user.as_ref().map(|u| u.user_id.as_str()).unwrap_or("-"),
            "Workflow started"
        );

        let mut inflight: JoinSet<AttemptReport> = JoinSet::new();
        let mut backoffs: JoinSet<String> = JoinSet::new();
        let mut timed_out = false;

        loop {
            if !timed_out {
                for id in graph.ready_tasks() {
                    self.dispatch(&mut graph, &id, &options, call_timeout, &mut inflight);
                }
            }
            if inflight.is_empty() && (timed_out || backoffs.is_empty()) {
                break;
            }

            tokio::select! {
                Some(joined) = inflight.join_next() => match joined {
                    Ok(report) => {
                        self.apply(&mut graph, report, timed_out, &mut backoffs);
                    }
                    Err(e) => error!(correlation_id = %correlation_id, error = %e, "Task attempt aborted"),
                },
                Some(joined) = backoffs.join_next(), if !timed_out => {
                    if let Ok(id) = joined {
                        self.dispatch(&mut graph, &id, &options, call_timeout, &mut inflight);
                    }
                },
                () = &mut deadline, if !timed_out => {
                    timed_out = true;
                    backoffs.abort_all();
                    warn!(
                        workflow = %workflow,
                        correlation_id = %correlation_id,
                        in_flight = inflight.len(),
                        "Workflow deadline exceeded, draining in-flight calls"
                    );
                },
                else => break,
            }
        }

        let cut_off = if timed_out {
            graph.skip_unfinished("workflow deadline exceeded")
        } else {
            if !graph.is_terminal() {
                let stuck = graph.skip_unfinished("no runnable path to this task");
                warn!(correlation_id = %correlation_id, tasks = ?stuck, "Skipped unreachable tasks");
            }
            Vec::new()
        };

        let result = self.assemble(workflow, &graph, timed_out, &cut_off, started_at);
        info!(
            workflow = %result.workflow,
            correlation_id = %correlation_id,
            status = %result.status,
            succeeded = result.outputs.len(),
            failed = result.failures.len(),
            cost_nanos = result.usage.cost_nanos,
            "Workflow finished"
        );
        result
    }

    fn dispatch(
        &self,
        graph: &mut TaskGraph,
        id: &str,
        options: &ExecutionOptions,
        call_timeout: Duration,
        inflight: &mut JoinSet<AttemptReport>,
    ) {
        if !graph.mark_running(id) {
            return;
        }
        let upstream = graph.upstream_outputs(id);
        let Some(task) = graph.get(id) else {
            return;
        };
        let request = AgentRequest {
            correlation_id: graph.correlation_id(),
            task_id: task.id.clone(),
            capability: task.capability,
            input: task.input.clone(),
            upstream,
            user_id: options.user.as_ref().map(|u| u.user_id.clone()),
            attempt: task.attempts.saturating_sub(1),
        };
        debug!(
            task = %task.id,
            capability = %task.capability,
            attempt = request.attempt,
            "Dispatching task"
        );

        let attempt = Attempt {
            registry: self.registry.clone(),
            limiter: self.limiter.clone(),
            accountant: self.accountant.clone(),
            user: options.user.clone(),
            request,
            call_timeout: task.call_timeout.unwrap_or(call_timeout),
        };
        inflight.spawn(attempt.run());
    }

    fn apply(
        &self,
        graph: &mut TaskGraph,
        report: AttemptReport,
        timed_out: bool,
        backoffs: &mut JoinSet<String>,
    ) {
        let AttemptReport { task_id, outcome } = report;
        match graph.advance(&task_id, outcome) {
            Some(TaskState::Succeeded) => info!(task = %task_id, "Task succeeded"),
            Some(TaskState::Retrying) => {
                let Some(task) = graph.get(&task_id) else {
                    return;
                };
                let delay = self.policy.backoff_for(task.retry_count.saturating_sub(1));
                warn!(
                    task = %task_id,
                    retry = task.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    reason = task.failure.as_deref().unwrap_or(""),
                    "Task failed transiently, retrying"
                );
                if !timed_out {
                    backoffs.spawn(async move {
                        tokio::time::sleep(delay).await;
                        task_id
                    });
                }
            }
            Some(TaskState::Failed) => {
                let reason = graph
                    .get(&task_id)
                    .and_then(|t| t.failure.clone())
                    .unwrap_or_default();
                warn!(task = %task_id, reason = %reason, "Task failed");
            }
            Some(state) => debug!(task = %task_id, state = %state, "Task advanced"),
            None => error!(task = %task_id, "Completion for a task that is not running"),
        }
    }

    fn assemble(
        &self,
        workflow: String,
        graph: &TaskGraph,
        timed_out: bool,
        cut_off: &[String],
        started_at: chrono::DateTime<Utc>,
    ) -> WorkflowResult {
        let mut outputs = BTreeMap::new();
        let mut failures = Vec::new();
        for task in graph.tasks() {
            match (task.state, &task.result) {
                (TaskState::Succeeded, Some(result)) => {
                    outputs.insert(task.id.clone(), result.clone());
                }
                (TaskState::Succeeded, None) => {
                    outputs.insert(task.id.clone(), Value::Null);
                }
                (state, _) => failures.push(TaskFailure {
                    task_id: task.id.clone(),
                    capability: task.capability,
                    state,
                    reason: task.failure.clone().unwrap_or_default(),
                    attempts: task.attempts,
                    required: task.required,
                }),
            }
        }

        // A required task the deadline cut off did not fail on its own.
        let required_failed = failures
            .iter()
            .any(|f| f.required && !cut_off.contains(&f.task_id));
        let status = if required_failed {
            WorkflowStatus::Failed
        } else if timed_out || !failures.is_empty() {
            WorkflowStatus::PartiallyFailed
        } else {
            WorkflowStatus::Completed
        };

        WorkflowResult {
            correlation_id: graph.correlation_id(),
            workflow,
            status,
            outputs,
            failures,
            timed_out,
            usage: self
                .accountant
                .aggregate(&UsageFilter::all().correlation(graph.correlation_id())),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

impl Attempt {
    /// A panic anywhere in the attempt, not only in the agent call, fails the task.
    async fn run(self) -> AttemptReport {
        let task_id = self.request.task_id.clone();
        let capability = self.request.capability;
        let outcome = match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_panic) => {
                error!(task = %task_id, capability = %capability, "Task attempt panicked");
                TaskOutcome::permanent(format!("attempt for '{capability}' panicked"))
            }
        };
        AttemptReport { task_id, outcome }
    }

    async fn execute(self) -> TaskOutcome {
        let capability = self.request.capability;
        let handle = match self.registry.resolve(capability, self.user.as_ref()).await {
            Ok(h) => h,
            Err(e) => {
                return TaskOutcome::Failed {
                    retryable: e.is_transient(),
                    reason: e.to_string(),
                }
            }
        };
        let _slot = match handle.slot().await {
            Ok(s) => s,
            Err(e) => return TaskOutcome::transient(e.to_string()),
        };

        let provider = handle.descriptor().provider.clone();
        if let Some(provider) = &provider {
            if let Err(e) = self
                .limiter
                .acquire(provider, 1, AcquireMode::Wait(self.call_timeout))
                .await
            {
                return TaskOutcome::transient(e.to_string());
            }
        }

        let task_id = self.request.task_id.clone();
        let correlation_id = self.request.correlation_id;
        let started = Instant::now();
        let invocation = AssertUnwindSafe(handle.agent().invoke(self.request)).catch_unwind();
        let result = tokio::time::timeout(self.call_timeout, invocation).await;
        let latency = started.elapsed();

        let (outcome, usage, success) = match result {
            Ok(Ok(Ok(output))) => (
                TaskOutcome::Succeeded(output.payload),
                output.usage.unwrap_or_default(),
                true,
            ),
            Ok(Ok(Err(e))) => (
                TaskOutcome::Failed {
                    retryable: e.is_transient(),
                    reason: e.to_string(),
                },
                TokenUsage::default(),
                false,
            ),
            Ok(Err(_panic)) => (
                TaskOutcome::permanent(format!("agent for '{capability}' panicked")),
                TokenUsage::default(),
                false,
            ),
            Err(_) => (
                TaskOutcome::transient(format!(
                    "call timed out after {}ms",
                    self.call_timeout.as_millis()
                )),
                TokenUsage::default(),
                false,
            ),
        };

        if let Some(provider) = provider {
            let mut call = ProviderCall::new(provider, capability)
                .usage(&usage)
                .correlation(correlation_id, task_id.clone())
                .latency(latency);
            if let Some(user) = &self.user {
                call = call.user(user.user_id.clone());
            }
            if !success {
                call = call.failed();
            }
            record(&self.accountant, call, &task_id, capability);
        }
        outcome
    }
}

fn record(accountant: &Accountant, call: ProviderCall, task_id: &str, capability: Capability) {
    if let Err(e) = accountant.record(call) {
        warn!(task = %task_id, capability = %capability, error = %e, "Dropped usage record");
    }
}
