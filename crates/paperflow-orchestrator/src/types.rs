use chrono::{DateTime, Utc};
use paperflow_agent::UserContext;
use paperflow_core::Capability;
use paperflow_usage::RunningTotal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on upstream tasks.
    Pending,
    /// Dependencies satisfied, not yet dispatched.
    Ready,
    /// An attempt is in flight.
    Running,
    Succeeded,
    Failed,
    /// Waiting out a backoff before the next attempt.
    Retrying,
    /// Never ran: an upstream failed or the deadline passed.
    Skipped,
}

impl TaskState {
    /// Succeeded, failed and skipped tasks never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Declarative description of a task, consumed by the graph builder.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    /// Unique within the graph.
    pub id: String,
    /// Capability the task is routed to.
    pub capability: Capability,
    /// Task-specific input handed to the agent.
    pub input: Value,
    /// Upstream tasks that must succeed first.
    pub depends_on: Vec<String>,
    /// Upstream tasks that must finish first, in any terminal state.
    pub optional_depends_on: Vec<String>,
    /// Whether the workflow fails when this task does not succeed.
    pub required: bool,
    /// Overrides the graph's default retry budget.
    pub max_retries: Option<u32>,
    /// Overrides the orchestrator's per-call timeout.
    pub call_timeout: Option<Duration>,
}

impl TaskSpec {
    /// A task with null input, no dependencies and default limits.
    pub fn new(id: impl Into<String>, capability: Capability) -> Self {
        Self {
            id: id.into(),
            capability,
            input: Value::Null,
            depends_on: Vec::new(),
            optional_depends_on: Vec::new(),
            required: false,
            max_retries: None,
            call_timeout: None,
        }
    }

    /// Set the agent input.
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Add hard dependencies.
    pub fn after<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Add soft dependencies; their failure does not skip this task.
    pub fn optionally_after<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_depends_on
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Mark the task as required for workflow success.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Retry budget for this task.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Per-call timeout for this task.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// A task inside a built graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the graph.
    pub id: String,
    /// Capability the task is routed to.
    pub capability: Capability,
    /// Task-specific input handed to the agent.
    pub input: Value,
    /// Upstream tasks that must succeed first.
    pub depends_on: Vec<String>,
    /// Upstream tasks that must reach any terminal state first.
    #[serde(default)]
    pub optional_depends_on: Vec<String>,
    /// Whether the workflow fails when this task does not succeed.
    #[serde(default)]
    pub required: bool,
    /// Retry budget override.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Per-call timeout override.
    #[serde(default)]
    pub call_timeout: Option<Duration>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Agent payload once succeeded.
    pub result: Option<Value>,
    /// Last failure or skip reason.
    pub failure: Option<String>,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Attempts dispatched so far.
    pub attempts: u32,
    /// First dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<TaskSpec> for Task {
    fn from(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            capability: spec.capability,
            input: spec.input,
            depends_on: spec.depends_on,
            optional_depends_on: spec.optional_depends_on,
            required: spec.required,
            max_retries: spec.max_retries,
            call_timeout: spec.call_timeout,
            state: TaskState::Pending,
            result: None,
            failure: None,
            retry_count: 0,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

impl Task {
    /// Hard and optional upstream ids.
    pub fn upstream_ids(&self) -> impl Iterator<Item = &String> {
        self.depends_on.iter().chain(&self.optional_depends_on)
    }
}

/// Result of one task attempt, fed back into the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Carries the agent payload.
    Succeeded(Value),
    /// Carries the reason and whether another attempt may help.
    Failed { reason: String, retryable: bool },
}

impl TaskOutcome {
    /// A failure that retrying will not fix.
    pub fn permanent(reason: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            reason: reason.into(),
            retryable: false,
        }
    }

    /// A failure worth retrying.
    pub fn transient(reason: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            reason: reason.into(),
            retryable: true,
        }
    }
}

/// Overall state derived from task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphState {
    Running,
    Completed,
    PartiallyFailed,
}

/// Final status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Every task succeeded.
    Completed,
    /// Some task failed or was skipped, or the deadline passed.
    PartiallyFailed,
    /// A required task did not succeed.
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::PartiallyFailed => write!(f, "partially_failed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A task that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Id of the task that did not succeed.
    pub task_id: String,
    /// Capability the task was routed to.
    pub capability: Capability,
    /// `Failed` or `Skipped`.
    pub state: TaskState,
    /// Last agent error or skip reason.
    pub reason: String,
    /// Attempts dispatched before giving up.
    pub attempts: u32,
    /// Whether the task was required.
    pub required: bool,
}

/// Outcome of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Identifies the run in logs and usage records.
    pub correlation_id: Uuid,
    /// Workflow name.
    pub workflow: String,
    /// Derived status.
    pub status: WorkflowStatus,
    /// Payloads of every succeeded task, keyed by task id.
    pub outputs: BTreeMap<String, Value>,
    /// Every task that failed or was skipped, in graph order.
    pub failures: Vec<TaskFailure>,
    /// Whether the overall deadline cut the run short.
    pub timed_out: bool,
    /// Provider usage attributed to this run.
    pub usage: RunningTotal,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    /// Payload of a succeeded task.
    pub fn output(&self, task_id: &str) -> Option<&Value> {
        self.outputs.get(task_id)
    }

    /// Failure record of a task, if it did not succeed.
    pub fn failure(&self, task_id: &str) -> Option<&TaskFailure> {
        self.failures.iter().find(|f| f.task_id == task_id)
    }
}

/// Per-run knobs for [`Orchestrator::execute`](crate::Orchestrator::execute).
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Owner of the run; required for user-scoped agents.
    pub user: Option<UserContext>,
    /// Overall deadline; the orchestrator default when `None`.
    pub timeout: Option<Duration>,
    /// Per-call timeout; the orchestrator default when `None`.
    pub call_timeout: Option<Duration>,
}

impl ExecutionOptions {
    /// Orchestrator defaults, no user.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run on behalf of a user.
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user = Some(UserContext::new(user_id));
        self
    }

    /// Set the overall deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}
